//! Integration tests for the queue module.
//!
//! These tests exercise `BookQueue` from many tasks at once: exclusive
//! claims, batch reorders, cancellation and the work signal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use book_downloader_core::queue::{BookMetadata, BookQueue, QueueStatus};

fn metadata(title: &str) -> BookMetadata {
    BookMetadata::new(title, "annas_archive")
}

fn filled_queue(count: usize) -> Arc<BookQueue> {
    let queue = Arc::new(BookQueue::new());
    for index in 0..count {
        let id = format!("book-{index:03}");
        assert!(queue.add(&id, 0, metadata(&id)));
    }
    queue
}

// ==================== Claims ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_hand_out_an_item_twice() {
    let queue = filled_queue(200);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some((id, _cancel)) = queue.get_next() {
                claimed.push(id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.expect("claim task"));
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200, "every item claimed exactly once");
    assert!(queue.get_next().is_none());
}

#[tokio::test]
async fn test_claim_order_follows_priority_then_admission() {
    let queue = BookQueue::new();
    queue.add("late-urgent", 0, metadata("a"));
    queue.add("normal-1", 5, metadata("b"));
    queue.add("normal-2", 5, metadata("c"));
    queue.add("urgent", -3, metadata("d"));

    let order: Vec<String> = std::iter::from_fn(|| queue.get_next().map(|(id, _)| id)).collect();
    assert_eq!(order, vec!["urgent", "late-urgent", "normal-1", "normal-2"]);
}

// ==================== Reorder ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reorder_is_applied_atomically_against_claims() {
    for _ in 0..20 {
        let queue = Arc::new(BookQueue::new());
        queue.add("a", 1, metadata("a"));
        queue.add("b", 2, metadata("b"));

        let reorderer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let swap = HashMap::from([("a".to_string(), 2_i64), ("b".to_string(), 1_i64)]);
                queue.reorder(&swap)
            })
        };
        let claimer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get_next().map(|(id, _)| id) })
        };

        let applied = reorderer.await.expect("reorder task");
        let first = claimer.await.expect("claim task").expect("an item");
        let a = queue.item("a").expect("a");
        let b = queue.item("b").expect("b");
        // Either the whole swap landed or none of it did.
        assert!(
            (a.priority == 2 && b.priority == 1) || (a.priority == 1 && b.priority == 2),
            "half-applied reorder: a={}, b={}",
            a.priority,
            b.priority
        );
        assert!(applied, "claimed items stay queued and accept new priorities");
        assert!(first == "a" || first == "b");
    }
}

#[tokio::test]
async fn test_reorder_reports_skipped_entries() {
    let queue = BookQueue::new();
    queue.add("running", 0, metadata("r"));
    queue.add("queued", 0, metadata("q"));
    let (running, _) = queue.get_next().expect("claim");
    assert_eq!(running, "running");
    queue.update_status(&running, QueueStatus::Downloading);

    let changes = HashMap::from([
        ("queued".to_string(), 9_i64),
        ("running".to_string(), 4_i64),
        ("ghost".to_string(), 1_i64),
    ]);
    assert!(!queue.reorder(&changes));
    assert_eq!(queue.item("queued").expect("queued").priority, 9);
    assert_eq!(queue.item("running").expect("running").priority, 0);
}

#[tokio::test]
async fn test_reorder_before_claim_promotes_late_item() {
    let queue = BookQueue::new();
    queue.add("early-a", 0, metadata("a"));
    queue.add("early-b", 0, metadata("b"));
    queue.add("late", 3, metadata("c"));

    let promote = HashMap::from([("late".to_string(), -1_i64)]);
    assert!(queue.reorder(&promote));
    let (first, _) = queue.get_next().expect("claim");
    assert_eq!(first, "late");
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_downloading_item_signals_worker_token() {
    let queue = BookQueue::new();
    queue.add("x", 0, metadata("x"));
    let (id, token) = queue.get_next().expect("claim");
    queue.update_status(&id, QueueStatus::Downloading);

    let waiter = tokio::spawn({
        let token = token.clone();
        async move { token.wait_timeout(Duration::from_secs(5)).await }
    });
    assert!(queue.cancel(&id));
    assert!(waiter.await.expect("waiter"), "worker observes cancellation");
    assert_eq!(
        queue.item(&id).expect("item").status,
        QueueStatus::Downloading,
        "worker finalizes the status"
    );
    assert!(queue.update_status(&id, QueueStatus::Cancelled));
    assert!(!queue.cancel(&id));
}

#[tokio::test]
async fn test_readding_cancelled_item_gets_fresh_token() {
    let queue = BookQueue::new();
    queue.add("x", 0, metadata("x"));
    assert!(queue.cancel("x"));
    assert_eq!(queue.item("x").expect("item").status, QueueStatus::Cancelled);

    assert!(queue.add("x", 0, metadata("x")));
    let (_, token) = queue.get_next().expect("claim");
    assert!(!token.is_cancelled());
}

// ==================== Work signal ====================

#[tokio::test]
async fn test_wait_for_work_times_out_when_idle() {
    let queue = BookQueue::new();
    assert!(!queue.wait_for_work(Duration::from_millis(20)).await);
}

// ==================== Housekeeping ====================

#[tokio::test]
async fn test_expire_stale_drops_old_terminal_items_only() {
    let queue = BookQueue::new();
    queue.add("done", 0, metadata("d"));
    queue.add("waiting", 0, metadata("w"));
    let (id, _) = queue.get_next().expect("claim");
    queue.update_status(&id, QueueStatus::Downloading);
    queue.update_status(&id, QueueStatus::Error);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.expire_stale(Duration::from_millis(10)), 1);
    assert!(queue.item("done").is_none());
    assert!(queue.item("waiting").is_some());
}
