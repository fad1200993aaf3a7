use super::*;
use crate::{EventQueue, OperationOutcome, QueueSettings};
use shared::domain::OperationId;

#[test]
fn counts_fulfilled_and_rejected() {
    let results = [
        Settled::Fulfilled,
        Settled::Rejected("Image is in use".to_string()),
        Settled::Fulfilled,
    ];
    assert_eq!(
        settled_counts(&results),
        SettledCounts {
            fulfilled: 2,
            rejected: 1
        }
    );
    assert_eq!(settled_counts(&[]), SettledCounts::default());
}

#[tokio::test]
async fn empty_bulk_action_completes_immediately() {
    let (_tracker, completion) = BulkTracker::new(0);
    assert!(completion.wait().await.expect("settled").is_empty());
}

#[tokio::test]
async fn completes_after_every_operation_settles() {
    let queue = EventQueue::new(QueueSettings {
        registration_ttl: None,
        ..QueueSettings::default()
    });
    let (tracker, completion) = BulkTracker::new(3);

    queue.register_callbacks("img-1", tracker.callbacks());
    queue.register_callbacks("img-2", tracker.callbacks());
    tracker.push_failure("connection refused");
    drop(tracker);

    queue.resolve(&OperationId::new("img-2"), OperationOutcome::Success);
    queue.resolve(
        &OperationId::new("img-1"),
        OperationOutcome::Failure("Image is in use".to_string()),
    );

    let results = completion.wait().await.expect("settled");
    assert_eq!(
        results,
        [
            Settled::Rejected("connection refused".to_string()),
            Settled::Fulfilled,
            Settled::Rejected("Image is in use".to_string()),
        ]
    );
}

#[tokio::test]
async fn outcomes_after_completion_are_ignored() {
    let (tracker, completion) = BulkTracker::new(1);
    tracker.push_success();
    tracker.push_failure("late");

    assert_eq!(
        completion.wait().await.expect("settled"),
        [Settled::Fulfilled]
    );
}

#[tokio::test]
async fn cancelled_registration_abandons_the_bulk_action() {
    let queue = EventQueue::default();
    let (tracker, completion) = BulkTracker::new(1);
    let token = queue.register_callbacks("img-3", tracker.callbacks());
    drop(tracker);

    assert!(queue.cancel(&token));

    let err = completion.wait().await.expect_err("abandoned");
    assert!(matches!(err, WaitError::BulkAbandoned { expected: 1 }));
}
