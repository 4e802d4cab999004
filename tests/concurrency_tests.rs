mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use runbook_lite::audit::Transition;
use runbook_lite::scheduler::{CancelOutcome, ClaimMessage, JobRequest, JobStatus};
use runbook_lite::shutdown::drain_workers;
use test_harness::*;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn slow_run(pause: Duration) -> Vec<Step> {
    vec![
        Step::Emit(play("Configure web servers")),
        Step::Sleep(pause),
        Step::Emit(recap(0, 0)),
    ]
}

#[tokio::test]
async fn test_jobs_run_in_parallel() {
    let executor = Arc::new(ScriptedExecutor::new(slow_run(Duration::from_millis(300))));
    let (node, _) = test_node(test_config().with_workers(4), executor.clone());
    let _workers = node.start(CancellationToken::new());

    let mut ids = Vec::new();
    for i in 0..4 {
        let server = if i % 2 == 0 { ACTIVE_SERVER } else { SECOND_SERVER };
        let job = node
            .create_job(JobRequest::new(ACTIVE_PLAYBOOK, server, "alice"))
            .await
            .unwrap();
        ids.push(job.job_id);
    }
    for id in &ids {
        let job = wait_for_terminal(&node, id).await;
        assert_eq!(job.status, JobStatus::Success);
    }

    assert_eq!(executor.launches(), 4);
    assert!(executor.max_in_flight() >= 2);
    let mut launched = executor.launched_jobs();
    launched.sort();
    ids.sort();
    assert_eq!(launched, ids);
}

#[tokio::test]
async fn test_redelivered_claim_does_not_run_twice() {
    let executor = Arc::new(ScriptedExecutor::new(slow_run(Duration::from_millis(300))));
    let (node, audit) = test_node(test_config().with_workers(3), executor.clone());
    let _workers = node.start(CancellationToken::new());

    let job = node
        .create_job(JobRequest::new(ACTIVE_PLAYBOOK, ACTIVE_SERVER, "alice"))
        .await
        .unwrap();
    wait_for_status(&node, &job.job_id, JobStatus::Running).await;

    // Duplicates while the first delivery is executing.
    let message = ClaimMessage { job_id: job.job_id };
    node.queue().publish(message).unwrap();
    node.queue().publish(message).unwrap();

    let finished = wait_for_terminal(&node, &job.job_id).await;
    assert_eq!(finished.status, JobStatus::Success);

    // And one after it has finished.
    node.queue().publish(message).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(executor.launches(), 1);
    let after = node.get_job(&job.job_id).await.unwrap();
    assert_eq!(after.status, JobStatus::Success);
    assert_eq!(after.completed_at, finished.completed_at);

    let plays = all_logs(&node, &job.job_id)
        .await
        .iter()
        .filter(|l| l.content.starts_with("PLAY ["))
        .count();
    assert_eq!(plays, 1);
    assert_eq!(audit.transitions(&job.job_id).len(), 3);
}

#[tokio::test]
async fn test_cancel_races_with_completion() {
    // Whichever side wins, the job ends in exactly one terminal state and
    // that state never changes afterwards.
    for _ in 0..10 {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Step::Emit(play("Quick play")),
            Step::Sleep(Duration::from_millis(5)),
            Step::Emit(recap(0, 0)),
        ]));
        let (node, audit) = test_node(test_config(), executor);
        let _workers = node.start(CancellationToken::new());

        let job = node
            .create_job(JobRequest::new(ACTIVE_PLAYBOOK, ACTIVE_SERVER, "alice"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = node.cancel(&job.job_id, "bob").await.unwrap();

        let settled = wait_for_terminal(&node, &job.job_id).await;
        assert_eq!(settled.status, outcome.status());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = node.get_job(&job.job_id).await.unwrap();
        assert_eq!(later.status, settled.status);
        assert_eq!(later.exit_code, settled.exit_code);

        let terminal_events = audit
            .transitions(&job.job_id)
            .iter()
            .filter(|t| matches!(t, Transition::Completed | Transition::Cancelled))
            .count();
        assert_eq!(terminal_events, 1);
    }
}

#[tokio::test]
async fn test_closing_line_agrees_with_final_status() {
    // The run finishes as soon as the gate opens; the cancel follows after a
    // varying number of yields so it lands at different points of completion.
    for yields in 0..20 {
        let gate = Arc::new(Notify::new());
        let executor = Arc::new(ScriptedExecutor::new(vec![
            Step::Emit(play("Quick play")),
            Step::Emit(recap(0, 0)),
            Step::Gate(gate.clone()),
        ]));
        let (node, _) = test_node(test_config(), executor);
        let _workers = node.start(CancellationToken::new());

        let job = node
            .create_job(JobRequest::new(ACTIVE_PLAYBOOK, ACTIVE_SERVER, "alice"))
            .await
            .unwrap();
        wait_for_status(&node, &job.job_id, JobStatus::Running).await;

        gate.notify_one();
        for _ in 0..yields {
            tokio::task::yield_now().await;
        }
        let outcome = node.cancel(&job.job_id, "bob").await.unwrap();

        let node = &node;
        let job_id = job.job_id;
        assert_eventually(
            || async move { !node.controller().is_active(&job_id).await },
            WAIT,
            "execution never wound down",
        )
        .await;

        let job = node.get_job(&job_id).await.unwrap();
        let logs = all_logs(node, &job_id).await;
        let succeeded = logs
            .iter()
            .filter(|l| l.content == "job completed successfully")
            .count();
        let cancelled = logs
            .iter()
            .filter(|l| l.content == "job cancelled by bob")
            .count();
        match job.status {
            JobStatus::Cancelled => {
                assert!(matches!(outcome, CancelOutcome::Cancelled { .. }));
                assert_eq!((succeeded, cancelled), (0, 1), "{:?}", logs);
            }
            JobStatus::Success => {
                assert_eq!(outcome, CancelOutcome::AlreadyTerminal(JobStatus::Success));
                assert_eq!((succeeded, cancelled), (1, 0), "{:?}", logs);
                assert_eq!(
                    logs.last().map(|l| l.content.as_str()),
                    Some("job completed successfully")
                );
            }
            other => panic!("unexpected final status {}", other),
        }
    }
}

#[tokio::test]
async fn test_shutdown_stops_idle_workers() {
    let executor = Arc::new(ScriptedExecutor::new(successful_run()));
    let (node, _) = test_node(test_config().with_workers(3), executor);
    let shutdown = CancellationToken::new();
    let workers = node.start(shutdown.clone());

    shutdown.cancel();
    let aborted = drain_workers(workers, Duration::from_secs(2)).await;
    assert_eq!(aborted, 0);
}
