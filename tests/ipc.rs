//! IPC server/client behaviour: queries, control commands, push mode and
//! tolerance of malformed frames.

use std::error::Error;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use jobmon::events::JobEvent;
use jobmon::ipc::frame::{Frame, read_frame, write_frame};
use jobmon::ipc::{ErrorKind, IpcClient, Request, Response, ServerFrame};
use jobmon::job::{InstanceSelector, RunState};
use jobmon::JobRuntime;

use jobmon_test_utils::builders::{ConfigBuilder, chatty_job, echo_job, sleep_job};
use jobmon_test_utils::recorder::EventRecorder;
use jobmon_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

async fn runtime(dir: &tempfile::TempDir) -> JobRuntime {
    let config = ConfigBuilder::new(dir.path()).build();
    JobRuntime::start(&config).await.expect("runtime starts")
}

#[tokio::test]
async fn list_instances_with_no_live_instances_is_empty() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let client = IpcClient::new(dir.path());

    let instances = client.list_instances(None).await?;
    assert!(instances.is_empty());

    // An unknown job filter also yields empty, not an error.
    let instances = client.list_instances(Some("no-such-job")).await?;
    assert!(instances.is_empty());

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn list_and_tail_live_instance() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let recorder = EventRecorder::attach(rt.bus(), None);
    let client = IpcClient::new(dir.path());

    let (instance, _handle) = rt.launch(chatty_job("talker"), None, Default::default());
    recorder.wait_for_state(RunState::Running).await;

    let instances = client.list_instances(Some("talker")).await?;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, instance.instance_id());
    assert_eq!(instances[0].state, RunState::Running);

    // Wait until output has been captured, then tail it over IPC.
    for _ in 0..200 {
        if instance.tail().len() >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    let tails = client
        .tail(&InstanceSelector::Job("talker".to_string()))
        .await?;
    assert_eq!(tails.len(), 1);
    let lines: Vec<String> = tails[0].lines.iter().map(|l| l.text.clone()).collect();
    assert!(lines.contains(&"out-line".to_string()), "lines: {lines:?}");

    let stopped = client
        .stop(&InstanceSelector::Instance(
            instance.instance_id().to_string(),
        ))
        .await?;
    assert_eq!(stopped, vec![instance.instance_id().to_string()]);
    recorder.wait_for_state(RunState::Stopped).await;

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stop_of_unknown_selector_reports_not_found() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let client = IpcClient::new(dir.path());

    let err = client
        .stop(&InstanceSelector::Instance("missing".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, jobmon::errors::JobmonError::NotFound(_)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stop_of_ambiguous_selector_is_rejected() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let recorder = EventRecorder::attach(rt.bus(), None);
    let client = IpcClient::new(dir.path());

    let (_a, _ha) = rt.launch(sleep_job("dup", 30), None, Default::default());
    let (_b, _hb) = rt.launch(sleep_job("dup", 30), None, Default::default());
    recorder.wait_for_state(RunState::Running).await;

    let err = client
        .stop(&InstanceSelector::Job("dup".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        jobmon::errors::JobmonError::Ambiguous { .. }
    ));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn release_over_ipc_frees_pending_instance() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let recorder = EventRecorder::attach(rt.bus(), None);
    let client = IpcClient::new(dir.path());

    let (instance, handle) = rt.launch(
        echo_job("gated"),
        Some("token-1".to_string()),
        Default::default(),
    );
    recorder.wait_for_state(RunState::Pending).await;

    assert_eq!(client.release("token-1").await?, 1);
    with_timeout(handle).await??;
    assert_eq!(instance.state(), RunState::Completed);

    // Consumed token releases nothing on a second call.
    assert_eq!(client.release("token-1").await?, 0);

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn subscribe_streams_lifecycle_events_in_order() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let client = IpcClient::new(dir.path());

    let mut events = client.subscribe(Some("watched")).await?;
    let (_instance, handle) = rt.launch(echo_job("watched"), None, Default::default());
    with_timeout(handle).await??;

    let mut states = Vec::new();
    while states.last() != Some(&RunState::Completed) {
        match with_timeout(events.recv()).await {
            Some(JobEvent::StateChanged { new_state, .. }) => states.push(new_state),
            Some(JobEvent::Output { .. }) => {}
            None => break,
        }
    }
    assert_eq!(
        states,
        vec![RunState::Created, RunState::Running, RunState::Completed]
    );

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_connection_survives() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;

    let mut stream = UnixStream::connect(rt.socket_path()).await?;

    // A length-correct frame whose payload is not valid JSON: dropped and
    // logged, never an answer, never a crash.
    let junk = b"{definitely not a request";
    stream.write_u32_le(junk.len() as u32).await?;
    stream.write_all(junk).await?;
    stream.flush().await?;

    // A well-formed request on the same connection still gets served.
    write_frame(&mut stream, &Request::ListInstances { job: None }).await?;
    match with_timeout(read_frame::<_, ServerFrame>(&mut stream)).await? {
        Some(Frame::Msg(ServerFrame::Response(Response::Instances { instances }))) => {
            assert!(instances.is_empty());
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // Other connections are equally unaffected.
    let client = IpcClient::new(dir.path());
    assert!(client.list_instances(None).await?.is_empty());

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tail_of_unknown_selector_reports_not_found() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;
    let client = IpcClient::new(dir.path());

    let err = client
        .tail(&InstanceSelector::Job("missing".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, jobmon::errors::JobmonError::NotFound(_)));

    rt.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn error_objects_carry_kind_over_the_wire() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let rt = runtime(&dir).await;

    let mut stream = UnixStream::connect(rt.socket_path()).await?;
    write_frame(
        &mut stream,
        &Request::Stop {
            selector: InstanceSelector::Instance("missing".to_string()),
        },
    )
    .await?;
    match with_timeout(read_frame::<_, ServerFrame>(&mut stream)).await? {
        Some(Frame::Msg(ServerFrame::Response(Response::Error { error }))) => {
            assert_eq!(error.kind, ErrorKind::NotFound);
            assert!(!error.message.is_empty());
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    rt.shutdown().await;
    Ok(())
}
