//! Pending/release semantics: latched instances park in PENDING until
//! their token is released, and listeners observe the full ordered
//! lifecycle.

use std::error::Error;

use jobmon::job::RunState;
use jobmon::supervisor::LaunchSpec;

use jobmon_test_utils::builders::echo_job;
use jobmon_test_utils::harness::harness;
use jobmon_test_utils::recorder::EventRecorder;
use jobmon_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn latched(token: &str) -> LaunchSpec {
    LaunchSpec {
        latch: Some(token.to_string()),
        ..LaunchSpec::default()
    }
}

#[tokio::test]
async fn latched_instance_runs_only_after_release() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h.supervisor.start(echo_job("gated"), latched("l1"));
    recorder.wait_for_state(RunState::Pending).await;

    // Zero releases: the instance stays PENDING.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(instance.state(), RunState::Pending);

    assert_eq!(h.latches.release("l1"), 1);
    with_timeout(handle).await??;

    assert_eq!(instance.state(), RunState::Completed);
    // The listener received exactly the lifecycle transitions, in order.
    assert_eq!(
        recorder.states(),
        vec![
            RunState::Created,
            RunState::Pending,
            RunState::Running,
            RunState::Completed,
        ]
    );

    // The token was consumed in full; releasing again is a no-op.
    assert_eq!(h.latches.release("l1"), 0);
    Ok(())
}

#[tokio::test]
async fn one_release_frees_every_instance_sharing_the_token() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (a, handle_a) = h.supervisor.start(echo_job("batch"), latched("shared"));
    let (b, handle_b) = h.supervisor.start(echo_job("batch"), latched("shared"));
    let (other, _other_handle) = h.supervisor.start(echo_job("batch"), latched("unrelated"));

    recorder.wait_for_state(RunState::Pending).await;
    for _ in 0..200 {
        if h.latches.waiting_on("shared") == 2 && h.latches.waiting_on("unrelated") == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    assert_eq!(h.latches.release("shared"), 2);
    with_timeout(handle_a).await??;
    with_timeout(handle_b).await??;

    assert_eq!(a.state(), RunState::Completed);
    assert_eq!(b.state(), RunState::Completed);
    // No instance outside the released set moved.
    assert_eq!(other.state(), RunState::Pending);
    Ok(())
}

#[tokio::test]
async fn releasing_unknown_token_is_a_noop() -> TestResult {
    init_tracing();
    let h = harness();
    assert_eq!(h.latches.release("never-created"), 0);
    Ok(())
}

#[tokio::test]
async fn stop_while_pending_terminates_without_running() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h.supervisor.start(echo_job("cancelled"), latched("l2"));
    recorder.wait_for_state(RunState::Pending).await;

    h.supervisor.request_stop(instance.instance_id())?;
    with_timeout(handle).await??;

    assert_eq!(instance.state(), RunState::Stopped);
    assert_eq!(
        recorder.states(),
        vec![RunState::Created, RunState::Pending, RunState::Stopped]
    );
    // The waiter was forgotten: a later release finds nothing.
    assert_eq!(h.latches.release("l2"), 0);
    Ok(())
}

#[tokio::test]
async fn interrupt_while_pending_is_failure_classified() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h.supervisor.start(echo_job("interrupted"), latched("l3"));
    recorder.wait_for_state(RunState::Pending).await;

    h.supervisor.request_interrupt(instance.instance_id())?;
    with_timeout(handle).await??;

    assert_eq!(instance.state(), RunState::Interrupted);
    assert!(instance.state().is_failure());
    Ok(())
}
