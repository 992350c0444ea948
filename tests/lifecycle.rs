//! End-to-end lifecycle of supervised instances: natural completion,
//! failure classification, disabled jobs and spawn failures.

use std::error::Error;

use jobmon::job::RunState;
use jobmon::supervisor::LaunchSpec;

use jobmon_test_utils::builders::{chatty_job, echo_job, exit_job, missing_binary_job};
use jobmon_test_utils::harness::harness;
use jobmon_test_utils::recorder::EventRecorder;
use jobmon_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn successful_run_completes_with_exit_zero() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h.supervisor.start(echo_job("hello"), LaunchSpec::default());
    with_timeout(handle).await??;

    let snap = instance.snapshot();
    assert_eq!(snap.state, RunState::Completed);
    assert_eq!(snap.lifecycle.exit_code(), Some(0));
    assert!(snap.ended.is_some());
    assert!(snap.error.is_none());

    // Without a latch, PENDING is skipped entirely.
    assert_eq!(
        recorder.states(),
        vec![RunState::Created, RunState::Running, RunState::Completed]
    );

    // Terminal instances are evicted from the live registry immediately
    // when persistence is disabled.
    assert!(h.registry.is_empty());
    assert!(!h.supervisor.is_alive(instance.instance_id()));
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_is_classified_failed() -> TestResult {
    init_tracing();
    let h = harness();

    let (instance, handle) = h.supervisor.start(exit_job("flaky", 3), LaunchSpec::default());
    with_timeout(handle).await??;

    let snap = instance.snapshot();
    assert_eq!(snap.state, RunState::Failed);
    assert_eq!(snap.lifecycle.exit_code(), Some(3));
    let error = snap.error.expect("failure detail recorded");
    assert!(error.message.contains("code 3"), "message: {}", error.message);
    Ok(())
}

#[tokio::test]
async fn disabled_job_goes_straight_to_disabled() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let launch = LaunchSpec {
        disabled: true,
        ..LaunchSpec::default()
    };
    let (instance, handle) = h.supervisor.start(echo_job("switched-off"), launch);
    with_timeout(handle).await??;

    assert_eq!(instance.state(), RunState::Disabled);
    assert_eq!(
        recorder.states(),
        vec![RunState::Created, RunState::Disabled]
    );
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_classified_failed_with_detail() -> TestResult {
    init_tracing();
    let h = harness();

    let (instance, handle) = h
        .supervisor
        .start(missing_binary_job("ghost"), LaunchSpec::default());
    with_timeout(handle).await??;

    let snap = instance.snapshot();
    assert_eq!(snap.state, RunState::Failed);
    assert!(snap.lifecycle.exit_code().is_none());
    let error = snap.error.expect("start failure detail recorded");
    assert!(
        error.message.contains("failed to start process"),
        "message: {}",
        error.message
    );
    Ok(())
}

#[tokio::test]
async fn output_is_buffered_and_published() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, _handle) = h.supervisor.start(chatty_job("chatty"), LaunchSpec::default());
    recorder.wait_for_state(RunState::Running).await;

    // Both streams end up in the tail ring; stderr also lands in the
    // error-output tail.
    for _ in 0..200 {
        if instance.tail().len() >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    let tail: Vec<String> = instance.tail().into_iter().map(|l| l.text).collect();
    assert!(tail.contains(&"out-line".to_string()), "tail: {tail:?}");
    assert!(tail.contains(&"err-line".to_string()), "tail: {tail:?}");
    assert_eq!(instance.snapshot().error_output, vec!["err-line"]);

    let chunks = recorder.output_chunks();
    assert!(chunks.contains(&"out-line".to_string()), "chunks: {chunks:?}");

    h.supervisor.request_stop(instance.instance_id())?;
    recorder.wait_for_state(RunState::Stopped).await;
    Ok(())
}

#[tokio::test]
async fn audit_trail_is_monotonic_and_consistent() -> TestResult {
    init_tracing();
    let h = harness();

    let (instance, handle) = h.supervisor.start(echo_job("audit"), LaunchSpec::default());
    with_timeout(handle).await??;

    let snap = instance.snapshot();
    let changes = snap.lifecycle.changes();
    assert!(!changes.is_empty());
    for pair in changes.windows(2) {
        assert!(pair[0].at <= pair[1].at, "timestamps must be non-decreasing");
    }
    assert_eq!(changes.last().map(|c| c.state), Some(snap.state));
    assert_eq!(snap.lifecycle.state(), snap.state);
    Ok(())
}
