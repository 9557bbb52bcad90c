use crate::helpers::{delivery, subscription, AckCall, RecordingAcknowledger, TestError};
use carrot_relay::consumers::{
    AggregatingHandler, AggregationError, Aggregator, BrokerAction, Delivery, DeliveryConsumer,
    ProcessingOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LIMIT: usize = 3;
const TIMEOUT: Duration = Duration::from_millis(1000);

type Outcome = ProcessingOutcome<TestError>;
type Batches = Arc<Mutex<Vec<Vec<u32>>>>;

/// An aggregator whose batch handler records every batch and answers with `outcome`.
fn recording_aggregator(outcome: Outcome) -> (Arc<Aggregator<u32, u32, TestError>>, Batches) {
    let batches = Batches::default();
    let handler = {
        let batches = batches.clone();
        move |batch: Vec<u32>, _: CancellationToken| {
            batches.lock().unwrap().push(batch);
            let outcome = outcome.clone();
            async move { outcome }
        }
    };
    let aggregator = Aggregator::new(LIMIT, TIMEOUT, handler).unwrap();
    (Arc::new(aggregator), batches)
}

fn submit(
    aggregator: &Arc<Aggregator<u32, u32, TestError>>,
    key: u32,
    message: u32,
) -> tokio::task::JoinHandle<Result<Outcome, AggregationError>> {
    let aggregator = aggregator.clone();
    tokio::spawn(async move {
        aggregator
            .aggregate(key, message, &CancellationToken::new())
            .await
    })
}

fn sorted(mut batch: Vec<u32>) -> Vec<u32> {
    batch.sort_unstable();
    batch
}

#[tokio::test(start_paused = true)]
async fn a_full_group_is_processed_once_and_every_member_gets_the_same_outcome() {
    // Arrange
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let started = Instant::now();

    // Act
    let waiters: Vec<_> = (1..=3).map(|message| submit(&aggregator, 42, message)).collect();
    let mut outcomes = vec![];
    for waiter in waiters {
        outcomes.push(waiter.await.unwrap().unwrap());
    }

    // Assert
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(outcomes, vec![Outcome::Acknowledged; 3]);
    let batches = batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(sorted(batches[0].clone()), vec![1, 2, 3]);
    assert_eq!(aggregator.pending_groups(), 0);
}

#[tokio::test(start_paused = true)]
async fn a_lone_message_is_processed_when_the_timeout_expires() {
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let started = Instant::now();

    let outcome = submit(&aggregator, 1, 10).await.unwrap().unwrap();

    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(outcome, Outcome::Acknowledged);
    assert_eq!(*batches.lock().unwrap(), vec![vec![10]]);
    assert_eq!(aggregator.pending_groups(), 0);
}

#[tokio::test(start_paused = true)]
async fn groups_with_different_keys_are_independent() {
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);

    let full: Vec<_> = (1..=3).map(|message| submit(&aggregator, 1, message)).collect();
    let partial = submit(&aggregator, 2, 100);
    for waiter in full {
        waiter.await.unwrap().unwrap();
    }

    // The full group does not wait for the partial one.
    assert_eq!(batches.lock().unwrap().len(), 1);
    assert_eq!(aggregator.pending_groups(), 1);

    partial.await.unwrap().unwrap();
    let batches = batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1], vec![100]);
}

#[tokio::test(start_paused = true)]
async fn a_message_racing_the_deadline_lands_in_exactly_one_batch() {
    // Arrange
    let invocations = Arc::new(AtomicUsize::new(0));
    let batches = Batches::default();
    let handler = {
        let invocations = invocations.clone();
        let batches = batches.clone();
        move |batch: Vec<u32>, _: CancellationToken| {
            invocations.fetch_add(1, Ordering::SeqCst);
            batches.lock().unwrap().push(batch);
            async { Outcome::Acknowledged }
        }
    };
    let aggregator = Arc::new(Aggregator::new(LIMIT, TIMEOUT, handler).unwrap());

    // Act
    let early: Vec<_> = (1..=2).map(|message| submit(&aggregator, 7, message)).collect();
    tokio::time::sleep(TIMEOUT).await;
    let late = submit(&aggregator, 7, 3);
    let mut results = vec![];
    for waiter in early {
        results.push(waiter.await.unwrap());
    }
    results.push(late.await.unwrap());

    // Assert
    for result in &results {
        assert!(
            !matches!(result, Err(AggregationError::RegistryCorruption(_))),
            "Unexpected registry corruption: {result:?}"
        );
        assert!(result.is_ok());
    }
    let batches = batches.lock().unwrap().clone();
    assert_eq!(invocations.load(Ordering::SeqCst), batches.len());
    let mut all: Vec<u32> = batches.iter().flatten().copied().collect();
    all.sort_unstable();
    assert_eq!(all, vec![1, 2, 3]);
    assert!(batches
        .iter()
        .any(|batch| batch.contains(&1) && batch.contains(&2)));
    assert_eq!(aggregator.pending_groups(), 0);

    // Nothing is left behind to be resolved a second time.
    tokio::time::sleep(TIMEOUT).await;
    assert_eq!(invocations.load(Ordering::SeqCst), batches.len());
}

#[tokio::test(start_paused = true)]
async fn the_batch_outcome_is_fanned_out_even_when_it_is_a_failure() {
    let (aggregator, _) = recording_aggregator(Outcome::Failure(TestError::Timeout));

    let waiters: Vec<_> = (1..=3).map(|message| submit(&aggregator, 5, message)).collect();

    for waiter in waiters {
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            Outcome::Failure(TestError::Timeout)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn a_cancelled_caller_never_triggers_the_batch_handler() {
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let cancellation = CancellationToken::new();

    let waiter = tokio::spawn({
        let aggregator = aggregator.clone();
        let cancellation = cancellation.clone();
        async move { aggregator.aggregate(1, 1, &cancellation).await }
    });
    tokio::task::yield_now().await;
    cancellation.cancel();

    assert!(matches!(
        waiter.await.unwrap(),
        Err(AggregationError::Cancelled)
    ));
    assert!(batches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_cancelled_caller_takes_its_message_out_of_the_group() {
    // Arrange
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let cancellation = CancellationToken::new();
    let cancelled = tokio::spawn({
        let aggregator = aggregator.clone();
        let cancellation = cancellation.clone();
        async move { aggregator.aggregate(1, 1, &cancellation).await }
    });
    tokio::task::yield_now().await;

    // Act
    cancellation.cancel();
    assert!(matches!(
        cancelled.await.unwrap(),
        Err(AggregationError::Cancelled)
    ));
    tokio::time::sleep(TIMEOUT * 10).await;

    // Assert
    assert_eq!(aggregator.pending_groups(), 0);

    // The next message for the same key starts a fresh group, with a fresh deadline.
    let started = Instant::now();
    let outcome = submit(&aggregator, 1, 2).await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Acknowledged);
    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(*batches.lock().unwrap(), vec![vec![2]]);
}

#[tokio::test(start_paused = true)]
async fn a_cancelled_caller_does_not_disturb_the_rest_of_its_group() {
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let cancellation = CancellationToken::new();
    let cancelled = tokio::spawn({
        let aggregator = aggregator.clone();
        let cancellation = cancellation.clone();
        async move { aggregator.aggregate(1, 1, &cancellation).await }
    });
    let staying = submit(&aggregator, 1, 2);
    tokio::task::yield_now().await;

    cancellation.cancel();
    assert!(cancelled.await.unwrap().is_err());
    assert_eq!(aggregator.pending_groups(), 1);

    assert_eq!(staying.await.unwrap().unwrap(), Outcome::Acknowledged);
    assert_eq!(*batches.lock().unwrap(), vec![vec![2]]);
    assert_eq!(aggregator.pending_groups(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_parent_token_releases_pending_groups() {
    let parent = CancellationToken::new();
    let batches = Batches::default();
    let handler = {
        let batches = batches.clone();
        move |batch: Vec<u32>, _: CancellationToken| {
            batches.lock().unwrap().push(batch);
            async { Outcome::Acknowledged }
        }
    };
    let aggregator = Arc::new(
        Aggregator::new(LIMIT, TIMEOUT, handler)
            .unwrap()
            .with_cancellation(&parent),
    );

    let waiter = submit(&aggregator, 1, 1);
    tokio::task::yield_now().await;
    parent.cancel();

    assert!(matches!(
        waiter.await.unwrap(),
        Err(AggregationError::Cancelled)
    ));
    assert!(batches.lock().unwrap().is_empty());
}

fn decode(delivery: &Delivery) -> Result<u32, TestError> {
    std::str::from_utf8(&delivery.data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(TestError::Malformed)
}

#[tokio::test(start_paused = true)]
async fn nine_deliveries_over_three_keys_are_settled_in_three_batches() {
    // Arrange
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let acknowledger = RecordingAcknowledger::default();
    let handler = AggregatingHandler::new(aggregator.clone(), decode, |message: &u32| message % 3);
    let consumer = DeliveryConsumer::builder(subscription(), ()).build(acknowledger.clone(), handler);
    let started = Instant::now();

    // Act
    let tasks: Vec<_> = (1..=9u64)
        .map(|tag| {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                consumer
                    .process(delivery(tag, tag.to_string().as_bytes()))
                    .await
            })
        })
        .collect();
    let mut actions = vec![];
    for task in tasks {
        actions.push(task.await.unwrap().unwrap());
    }

    // Assert
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(actions, vec![BrokerAction::Ack; 9]);
    let mut batches: Vec<Vec<u32>> = batches.lock().unwrap().iter().cloned().map(sorted).collect();
    batches.sort();
    assert_eq!(batches, vec![vec![1, 4, 7], vec![2, 5, 8], vec![3, 6, 9]]);

    let mut acked: Vec<u64> = acknowledger
        .calls()
        .into_iter()
        .map(|call| match call {
            AckCall::Ack { tag, .. } => tag,
            other => panic!("Unexpected broker call: {other:?}"),
        })
        .collect();
    acked.sort_unstable();
    assert_eq!(acked, (1..=9).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn undecodable_deliveries_never_reach_the_aggregator() {
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let acknowledger = RecordingAcknowledger::default();
    let handler = AggregatingHandler::new(aggregator.clone(), decode, |message: &u32| *message);
    let consumer = DeliveryConsumer::builder(subscription(), ()).build(acknowledger.clone(), handler);

    let action = consumer.process(delivery(1, b"not a number")).await.unwrap();

    assert_eq!(action, BrokerAction::Nack { requeue: false });
    assert_eq!(aggregator.pending_groups(), 0);
    assert!(batches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutting_down_the_consumer_leaves_aggregated_deliveries_unsettled() {
    let (aggregator, batches) = recording_aggregator(Outcome::Acknowledged);
    let acknowledger = RecordingAcknowledger::default();
    let handler = AggregatingHandler::new(aggregator.clone(), decode, |message: &u32| *message);
    let consumer = DeliveryConsumer::builder(subscription(), ()).build(acknowledger.clone(), handler);

    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.process(delivery(1, b"1")).await }
    });
    tokio::task::yield_now().await;
    consumer.cancellation().cancel();

    assert_eq!(task.await.unwrap().unwrap(), BrokerAction::Unsettled);
    assert!(acknowledger.calls().is_empty());
    assert!(batches.lock().unwrap().is_empty());
}
