// tests/orchestrator.rs
//
// Queued digests: admission, duplicate rejection, cancellation of waiting and
// running items, re-enqueue after a terminal step, the shared AI cap.

mod common;

use std::sync::Arc;
use std::time::Duration;

use feed_digest::digest::{DigestId, DigestRepository};
use feed_digest::scheduler::{CancelOutcome, SchedulerError};
use feed_digest::steps::{DigestStatus, StepKind};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use common::*;

fn one_post_feeds() -> (feed_digest::digest::FeedId, ScriptedFeeds) {
    let a = feed("https://a.test/rss");
    let feeds = ScriptedFeeds::new().with_posts(&a, vec![post(&a, "a1", 10, 8)]);
    (a, feeds)
}

fn terminal_count(kinds: &[StepKind]) -> usize {
    kinds.iter().filter(|k| k.is_terminal()).count()
}

#[tokio::test]
async fn queued_digest_runs_to_success() {
    let (a, feeds) = one_post_feeds();
    let h = harness(2, feeds, CountingAi::new());
    let id = DigestId::new();

    h.orchestrator
        .queue_digest(id, last_day_filter(vec![a]), CancellationToken::new())
        .unwrap();

    assert_eq!(wait_for_terminal(&h.steps, id).await, StepKind::Success);
    let steps = kinds(&h.steps, id);
    assert_eq!(steps[0], StepKind::Queued);
    assert_eq!(steps[1], StepKind::ProcessingStarted);
    assert_eq!(terminal_count(&steps), 1);
    assert!(h.repository.load_digest(id).await.unwrap().is_some());

    let p = h.orchestrator.progress(id).unwrap();
    assert_eq!(p.status, DigestStatus::Completed);
    assert_eq!(p.percent_complete, 100);
}

#[tokio::test]
async fn duplicate_is_rejected_until_terminal_then_reenqueue_succeeds() {
    let (a, feeds) = one_post_feeds();
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(1, feeds, CountingAi::new().gated(gate.clone()));
    let id = DigestId::new();
    let filter = last_day_filter(vec![a]);

    h.orchestrator
        .queue_digest(id, filter.clone(), CancellationToken::new())
        .unwrap();
    let dup = h
        .orchestrator
        .queue_digest(id, filter.clone(), CancellationToken::new());
    assert!(matches!(dup, Err(SchedulerError::AlreadyQueued(_))));

    wait_until("digest running", || h.orchestrator.list_running() == vec![id]).await;
    let dup = h
        .orchestrator
        .queue_digest(id, filter.clone(), CancellationToken::new());
    assert!(matches!(dup, Err(SchedulerError::AlreadyQueued(_))));
    // Rejected duplicates leave no trace.
    assert_eq!(
        kinds(&h.steps, id).iter().filter(|k| **k == StepKind::Queued).count(),
        1
    );

    gate.add_permits(100);
    assert_eq!(wait_for_terminal(&h.steps, id).await, StepKind::Success);

    h.orchestrator
        .queue_digest(id, filter, CancellationToken::new())
        .expect("re-enqueue after terminal");
    wait_until("second run finished", || {
        terminal_count(&kinds(&h.steps, id)) == 2
    })
    .await;

    let steps = kinds(&h.steps, id);
    assert_eq!(steps.last(), Some(&StepKind::Success));
    assert_eq!(h.steps.latest_run(id)[0].kind, StepKind::Queued);
}

#[tokio::test]
async fn cancelling_a_waiting_digest_never_runs_the_pipeline() {
    let (a, feeds) = one_post_feeds();
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(1, feeds, CountingAi::new().gated(gate.clone()));
    let first = DigestId::new();
    let second = DigestId::new();

    h.orchestrator
        .queue_digest(first, last_day_filter(vec![a.clone()]), CancellationToken::new())
        .unwrap();
    wait_until("first running", || h.orchestrator.list_running() == vec![first]).await;
    h.orchestrator
        .queue_digest(second, last_day_filter(vec![a]), CancellationToken::new())
        .unwrap();
    assert_eq!(h.orchestrator.list_waiting(), vec![second]);

    assert_eq!(
        h.orchestrator.cancel(second).unwrap(),
        CancelOutcome::RemovedWaiting
    );
    assert!(h.orchestrator.list_waiting().is_empty());
    assert_eq!(kinds(&h.steps, second), vec![StepKind::Queued, StepKind::Cancelled]);

    gate.add_permits(100);
    assert_eq!(wait_for_terminal(&h.steps, first).await, StepKind::Success);
    assert_eq!(h.feeds.calls(), 1, "only the first digest read its feeds");
}

#[tokio::test]
async fn cancelling_a_running_digest_records_cancelled_and_frees_the_slot() {
    let (a, feeds) = one_post_feeds();
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(1, feeds, CountingAi::new().gated(gate.clone()));
    let running = DigestId::new();
    let next = DigestId::new();

    h.orchestrator
        .queue_digest(running, last_day_filter(vec![a.clone()]), CancellationToken::new())
        .unwrap();
    wait_until("AI call in flight", || h.ai.in_flight() == 1).await;
    h.orchestrator
        .queue_digest(next, last_day_filter(vec![a]), CancellationToken::new())
        .unwrap();

    assert_eq!(
        h.orchestrator.cancel(running).unwrap(),
        CancelOutcome::CancellationRequested
    );
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), wait_for_terminal(&h.steps, running))
            .await
            .unwrap(),
        StepKind::Cancelled
    );
    assert_eq!(terminal_count(&kinds(&h.steps, running)), 1);

    // The freed worker picks up the next digest.
    gate.add_permits(100);
    assert_eq!(wait_for_terminal(&h.steps, next).await, StepKind::Success);
    wait_until("queue drained", || {
        h.orchestrator.list_running().is_empty() && h.orchestrator.list_cancellation_requested().is_empty()
    })
    .await;
}

#[tokio::test]
async fn caller_token_cancels_a_queued_digest() {
    let (a, feeds) = one_post_feeds();
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(1, feeds, CountingAi::new().gated(gate.clone()));
    let id = DigestId::new();
    let caller = CancellationToken::new();

    h.orchestrator
        .queue_digest(id, last_day_filter(vec![a]), caller.clone())
        .unwrap();
    wait_until("AI call in flight", || h.ai.in_flight() == 1).await;
    caller.cancel();

    assert_eq!(wait_for_terminal(&h.steps, id).await, StepKind::Cancelled);
    assert!(h.repository.is_empty());
}

#[tokio::test]
async fn cancel_of_unknown_digest_is_reported() {
    let (_, feeds) = one_post_feeds();
    let h = harness(1, feeds, CountingAi::new());
    assert!(matches!(
        h.orchestrator.cancel(DigestId::new()),
        Err(SchedulerError::NotFound(_))
    ));
}

#[tokio::test]
async fn queued_failure_ends_in_a_single_error_step() {
    let (a, feeds) = one_post_feeds();
    let h = harness(1, feeds, CountingAi::new().failing_on(1));
    let id = DigestId::new();

    h.orchestrator
        .queue_digest(id, last_day_filter(vec![a]), CancellationToken::new())
        .unwrap();

    let terminal = wait_for_terminal(&h.steps, id).await;
    assert!(matches!(terminal, StepKind::Error { .. }), "got {terminal:?}");
    assert!(h.orchestrator.list_running().is_empty());
    assert_eq!(terminal_count(&kinds(&h.steps, id)), 1);
}

#[tokio::test]
async fn queued_digests_share_one_ai_cap() {
    let a = feed("https://a.test/rss");
    let posts = (0..6).map(|i| post(&a, &format!("p{i}"), 30 - i, 5)).collect();
    let h = harness(
        2,
        ScriptedFeeds::new().with_posts(&a, posts),
        CountingAi::new().with_latency(Duration::from_millis(5)),
    );

    let ids: Vec<DigestId> = (0..5).map(|_| DigestId::new()).collect();
    for id in &ids {
        h.orchestrator
            .queue_digest(*id, last_day_filter(vec![a.clone()]), CancellationToken::new())
            .unwrap();
    }
    for id in &ids {
        assert_eq!(wait_for_terminal(&h.steps, *id).await, StepKind::Success);
    }
    assert!(h.ai.max_in_flight() <= 2, "max in flight = {}", h.ai.max_in_flight());
    assert_eq!(h.repository.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_digest_can_be_queued_again_right_away() {
    let (a, feeds) = one_post_feeds();
    let h = harness(2, feeds, CountingAi::new());
    let filter = last_day_filter(vec![a]);

    for _ in 0..200 {
        let id = DigestId::new();
        h.orchestrator
            .queue_digest(id, filter.clone(), CancellationToken::new())
            .unwrap();
        while !h.steps.is_finished(id) {
            tokio::task::yield_now().await;
        }
        h.orchestrator
            .queue_digest(id, filter.clone(), CancellationToken::new())
            .expect("id is free once its terminal step is visible");
        wait_until("second run finished", || terminal_count(&kinds(&h.steps, id)) == 2).await;
    }
}

#[tokio::test]
async fn already_cancelled_caller_token_stops_the_run_before_it_starts() {
    let (a, feeds) = one_post_feeds();
    let h = harness(1, feeds, CountingAi::new());
    let caller = CancellationToken::new();
    caller.cancel();

    let id = DigestId::new();
    h.orchestrator
        .queue_digest(id, last_day_filter(vec![a]), caller)
        .unwrap();

    assert_eq!(wait_for_terminal(&h.steps, id).await, StepKind::Cancelled);
    assert_eq!(kinds(&h.steps, id), vec![StepKind::Queued, StepKind::Cancelled]);
    assert_eq!(h.feeds.calls(), 0);
}
