use crate::helpers::{
    delivery, redelivery, subscription, subscription_with_budgets, AckCall, RecordingAcknowledger,
    ScriptedHandler, TestError,
};
use carrot_relay::consumers::{
    BrokerAction, ConsumerError, Delivery, DeliveryConsumer, HandlerError, ProcessingOutcome,
    SubscriptionInfo, TopicInfo,
};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn a_retryable_failure_is_retried_until_the_budget_is_spent_then_nacked_once() {
    // Arrange
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::failing(TestError::Timeout);
    let observed = Arc::new(Mutex::new(vec![]));
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(2, 0), ())
        .retry_on(|e: &TestError| *e == TestError::Timeout)
        .with_retry_observer({
            let observed = observed.clone();
            move |_: &Delivery, error: &TestError, attempt: u32| -> Result<(), anyhow::Error> {
                observed.lock().unwrap().push((error.clone(), attempt));
                Ok(())
            }
        })
        .build(acknowledger.clone(), handler.clone());

    // Act
    let action = consumer.process(delivery(1, b"payload")).await.unwrap();

    // Assert
    assert_eq!(handler.invocations(), 3);
    assert_eq!(action, BrokerAction::Nack { requeue: false });
    assert_eq!(
        acknowledger.calls(),
        vec![AckCall::Nack {
            tag: 1,
            multiple: false,
            requeue: false
        }]
    );
    assert_eq!(
        *observed.lock().unwrap(),
        vec![(TestError::Timeout, 1), (TestError::Timeout, 2)]
    );
}

#[tokio::test]
async fn without_a_retry_budget_the_handler_runs_once() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::failing(TestError::Timeout);
    let consumer = DeliveryConsumer::builder(subscription(), ())
        .build(acknowledger.clone(), handler.clone());

    let action = consumer.process(delivery(7, b"payload")).await.unwrap();

    assert_eq!(handler.invocations(), 1);
    assert_eq!(action, BrokerAction::Nack { requeue: false });
    assert_eq!(acknowledger.calls().len(), 1);
}

#[tokio::test]
async fn non_retryable_errors_stop_the_retries_immediately() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::failing(TestError::Malformed);
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(5, 0), ())
        .retry_on(|e: &TestError| *e == TestError::Timeout)
        .build(acknowledger.clone(), handler.clone());

    consumer.process(delivery(1, b"payload")).await.unwrap();

    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn a_retry_that_succeeds_is_acknowledged() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::new(|_, _, invocation| {
        if invocation < 3 {
            Err(HandlerError::Failed(TestError::Timeout))
        } else {
            Ok(ProcessingOutcome::Acknowledged)
        }
    });
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(3, 0), ())
        .build(acknowledger.clone(), handler.clone());

    let action = consumer.process(delivery(4, b"payload")).await.unwrap();

    assert_eq!(handler.invocations(), 3);
    assert_eq!(action, BrokerAction::Ack);
    assert_eq!(
        acknowledger.calls(),
        vec![AckCall::Ack {
            tag: 4,
            multiple: false
        }]
    );
}

#[tokio::test]
async fn a_failing_retry_observer_does_not_change_the_outcome() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::failing(TestError::Timeout);
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(1, 0), ())
        .with_retry_observer(
            |_: &Delivery, _: &TestError, _: u32| -> Result<(), anyhow::Error> {
                Err(anyhow::anyhow!("metrics are down"))
            },
        )
        .build(acknowledger.clone(), handler.clone());

    let action = consumer.process(delivery(1, b"payload")).await.unwrap();

    assert_eq!(handler.invocations(), 2);
    assert_eq!(action, BrokerAction::Nack { requeue: false });
}

#[tokio::test]
async fn auto_ack_subscriptions_do_not_ack_twice() {
    let acknowledger = RecordingAcknowledger::default();
    let subscription = SubscriptionInfo::builder(TopicInfo::new("payments").unwrap(), "audit")
        .auto_ack(true)
        .build()
        .unwrap();
    let consumer = DeliveryConsumer::builder(subscription, ()).build(
        acknowledger.clone(),
        ScriptedHandler::returning(ProcessingOutcome::Acknowledged),
    );

    let action = consumer.process(delivery(1, b"payload")).await.unwrap();

    assert_eq!(action, BrokerAction::AutoAck);
    assert!(acknowledger.calls().is_empty());
}

#[tokio::test]
async fn rejected_messages_are_requeued_while_the_dead_letter_budget_lasts() {
    let acknowledger = RecordingAcknowledger::default();
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(0, 3), ()).build(
        acknowledger.clone(),
        ScriptedHandler::returning(ProcessingOutcome::reject("stale quote")),
    );

    let first = consumer.process(redelivery(1, 2)).await.unwrap();
    let last = consumer.process(redelivery(2, 3)).await.unwrap();

    assert_eq!(first, BrokerAction::Reject { requeue: true });
    assert_eq!(last, BrokerAction::Reject { requeue: false });
    assert_eq!(
        acknowledger.calls(),
        vec![
            AckCall::Reject {
                tag: 1,
                requeue: true
            },
            AckCall::Reject {
                tag: 2,
                requeue: false
            },
        ]
    );
}

#[tokio::test]
async fn negatively_acknowledged_messages_are_nacked_within_the_budget() {
    let acknowledger = RecordingAcknowledger::default();
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(0, 1), ()).build(
        acknowledger.clone(),
        ScriptedHandler::returning(ProcessingOutcome::nack("ledger is locked").unwrap()),
    );

    let action = consumer.process(delivery(9, b"payload")).await.unwrap();

    assert_eq!(action, BrokerAction::Nack { requeue: true });
}

#[tokio::test]
async fn an_unsupported_outcome_is_never_acknowledged() {
    let acknowledger = RecordingAcknowledger::default();
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(0, 2), ()).build(
        acknowledger.clone(),
        ScriptedHandler::returning(ProcessingOutcome::NegativelyAcknowledged {
            reason: "  ".into(),
        }),
    );

    let error = consumer.process(delivery(3, b"payload")).await.unwrap_err();

    assert!(matches!(
        error,
        ConsumerError::OutcomeApplication { delivery_tag: 3, .. }
    ));
    assert_eq!(
        acknowledger.calls(),
        vec![AckCall::Reject {
            tag: 3,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn a_failed_ack_is_followed_by_a_forced_reject() {
    let acknowledger = RecordingAcknowledger::failing();
    let consumer = DeliveryConsumer::builder(subscription(), ()).build(
        acknowledger.clone(),
        ScriptedHandler::returning(ProcessingOutcome::Acknowledged),
    );

    let error = consumer.process(delivery(5, b"payload")).await.unwrap_err();

    assert!(matches!(
        error,
        ConsumerError::OutcomeApplication { delivery_tag: 5, .. }
    ));
    assert_eq!(
        acknowledger.calls(),
        vec![
            AckCall::Ack {
                tag: 5,
                multiple: false
            },
            AckCall::Reject {
                tag: 5,
                requeue: false
            },
        ]
    );
}

#[tokio::test]
async fn fatal_handler_errors_reject_the_message_and_are_returned() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::new(|_, _, _| {
        Err(HandlerError::Fatal(anyhow::anyhow!("registry corrupted")))
    });
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(3, 0), ())
        .build(acknowledger.clone(), handler.clone());

    let error = consumer.process(delivery(2, b"payload")).await.unwrap_err();

    assert!(matches!(error, ConsumerError::Unrecoverable(_)));
    assert_eq!(handler.invocations(), 1);
    assert_eq!(
        acknowledger.calls(),
        vec![AckCall::Reject {
            tag: 2,
            requeue: false
        }]
    );
}

#[tokio::test]
async fn cancelled_processing_leaves_the_delivery_unsettled() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::new(|_, _, _| Err(HandlerError::Cancelled));
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(3, 0), ())
        .build(acknowledger.clone(), handler.clone());

    let action = consumer.process(delivery(1, b"payload")).await.unwrap();

    assert_eq!(action, BrokerAction::Unsettled);
    assert_eq!(handler.invocations(), 1);
    assert!(acknowledger.calls().is_empty());
}

#[tokio::test]
async fn cancellation_stops_the_retries() {
    let acknowledger = RecordingAcknowledger::default();
    // The handler fails and asks for a shutdown on its first invocation.
    let handler = ScriptedHandler::new(|_, cancellation, _| {
        cancellation.cancel();
        Err(HandlerError::Failed(TestError::Timeout))
    });
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(3, 0), ())
        .build(acknowledger.clone(), handler.clone());

    let action = consumer.process(delivery(1, b"payload")).await.unwrap();

    assert_eq!(action, BrokerAction::Unsettled);
    assert_eq!(handler.invocations(), 1);
    assert!(acknowledger.calls().is_empty());
}

#[tokio::test]
async fn deliveries_received_after_a_shutdown_request_are_not_handled() {
    let acknowledger = RecordingAcknowledger::default();
    let handler = ScriptedHandler::returning(ProcessingOutcome::Acknowledged);
    let consumer = DeliveryConsumer::builder(subscription_with_budgets(3, 0), ())
        .build(acknowledger.clone(), handler.clone());
    consumer.cancellation().cancel();

    let action = consumer.process(delivery(1, b"payload")).await.unwrap();

    assert_eq!(action, BrokerAction::Unsettled);
    assert_eq!(handler.invocations(), 0);
    assert!(acknowledger.calls().is_empty());
}

#[tokio::test]
async fn the_handler_sees_the_delivery_and_the_subscription() {
    let acknowledger = RecordingAcknowledger::default();
    let seen = Arc::new(Mutex::new(None));
    let handler = ScriptedHandler::new({
        let seen = seen.clone();
        move |incoming, _, _| {
            *seen.lock().unwrap() = Some((
                incoming.subscription_name.clone(),
                incoming.message.message_id().map(str::to_owned),
                incoming.message.data.clone(),
            ));
            Ok(ProcessingOutcome::Acknowledged)
        }
    });
    let consumer = DeliveryConsumer::builder(subscription(), ()).build(acknowledger, handler);

    consumer.process(delivery(8, b"hello")).await.unwrap();

    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((
            "settlement".to_owned(),
            Some("m-8".to_owned()),
            b"hello".to_vec()
        ))
    );
}
