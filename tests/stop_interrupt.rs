//! Stop and interrupt classification: a requested stop is never a
//! failure and always reaches STOPPED (escalating past the grace period
//! if needed); an interrupt is always failure-classified regardless of
//! the child's own exit code.

#![cfg(unix)]

use std::error::Error;

use jobmon::job::RunState;
use jobmon::supervisor::LaunchSpec;

use jobmon_test_utils::builders::{int_exits_zero_job, sleep_job, term_ignoring_job};
use jobmon_test_utils::harness::harness;
use jobmon_test_utils::recorder::EventRecorder;
use jobmon_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn stop_within_grace_period_is_stopped() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h
        .supervisor
        .start(sleep_job("stoppable", 30), LaunchSpec::default());
    recorder.wait_for_state(RunState::Running).await;

    h.supervisor.request_stop(instance.instance_id())?;
    with_timeout(handle).await??;

    assert_eq!(instance.state(), RunState::Stopped);
    assert!(!instance.state().is_failure());
    Ok(())
}

#[tokio::test]
async fn stop_escalates_past_ignored_sigterm_and_still_reports_stopped() -> TestResult {
    init_tracing();
    // Harness uses a one-second grace period.
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h
        .supervisor
        .start(term_ignoring_job("stubborn"), LaunchSpec::default());
    recorder.wait_for_state(RunState::Running).await;

    h.supervisor.request_stop(instance.instance_id())?;
    with_timeout(handle).await??;

    // Escalation (SIGKILL) still classifies the outcome as STOPPED,
    // never UNKNOWN.
    assert_eq!(instance.state(), RunState::Stopped);
    Ok(())
}

#[tokio::test]
async fn interrupt_wins_over_clean_child_exit() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    // The child traps SIGINT and exits 0; the classification must still
    // be INTERRUPTED.
    let (instance, handle) = h
        .supervisor
        .start(int_exits_zero_job("trapped"), LaunchSpec::default());
    recorder.wait_for_state(RunState::Running).await;

    h.supervisor.request_interrupt(instance.instance_id())?;
    with_timeout(handle).await??;

    let snap = instance.snapshot();
    assert_eq!(snap.state, RunState::Interrupted);
    assert_ne!(snap.state, RunState::Completed);
    assert_eq!(snap.lifecycle.exit_code(), Some(0));
    assert!(snap.state.is_failure());
    Ok(())
}

#[tokio::test]
async fn stop_request_is_fire_and_forget() -> TestResult {
    init_tracing();
    let h = harness();
    let recorder = EventRecorder::attach(&h.bus, None);

    let (instance, handle) = h
        .supervisor
        .start(sleep_job("async-stop", 30), LaunchSpec::default());
    recorder.wait_for_state(RunState::Running).await;

    // The request returns once accepted, before the instance is terminal.
    h.supervisor.request_stop(instance.instance_id())?;
    assert!(!instance.state().is_terminal() || instance.state() == RunState::Stopped);

    with_timeout(handle).await??;
    assert_eq!(instance.state(), RunState::Stopped);
    Ok(())
}

#[tokio::test]
async fn stop_of_unknown_instance_is_not_found() -> TestResult {
    init_tracing();
    let h = harness();
    let err = h.supervisor.request_stop("no-such-instance").unwrap_err();
    assert!(matches!(err, jobmon::errors::JobmonError::NotFound(_)));
    Ok(())
}
