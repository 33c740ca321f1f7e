mod common;

use std::time::Duration;

use futures_util::StreamExt;
use wamp_client::{
    core::{
        error::{
            InteractionError,
            MessageStreamLaggedError,
            PeerNotConnectedError,
            WampError,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        ErrorMessage,
        Message,
        ResultMessage,
    },
    peer::{
        RpcCall,
        RpcResult,
        call,
    },
};

use crate::common::{
    TestRouter,
    id,
};

fn procedure() -> Uri {
    Uri::try_from("com.myapp.add2").unwrap()
}

fn result_message(request: u64, value: u64, progress: bool) -> Message {
    let mut details = Dictionary::default();
    if progress {
        details.insert("progress".to_owned(), Value::Bool(true));
    }
    Message::Result(ResultMessage {
        call_request: id(request),
        details,
        yield_arguments: List::from_iter([Value::Integer(value)]),
        yield_arguments_keyword: Dictionary::default(),
    })
}

fn error_message(request: u64, error: &str) -> Message {
    Message::Error(ErrorMessage {
        request_type: 48,
        request: id(request),
        details: Dictionary::default(),
        error: Uri::try_from(error).unwrap(),
        arguments: List::from_iter([Value::String("failed".to_owned())]),
        arguments_keyword: Dictionary::default(),
    })
}

#[tokio::test]
async fn sends_call_with_options() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let pending = call(
        router.link(),
        procedure(),
        RpcCall {
            arguments: List::from_iter([Value::Integer(1), Value::Integer(2)]),
            timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        },
        true,
    )
    .await
    .unwrap();
    assert_eq!(pending.request_id(), id(1));

    assert_matches::assert_matches!(router.next_sent().await, Message::Call(message) => {
        assert_eq!(message.request, id(1));
        assert_eq!(message.procedure, procedure());
        pretty_assertions::assert_eq!(
            message.arguments,
            List::from_iter([Value::Integer(1), Value::Integer(2)])
        );
        assert_eq!(message.options.get("receive_progress"), Some(&Value::Bool(true)));
        assert_eq!(message.options.get("timeout"), Some(&Value::Integer(3000)));
    });
}

#[tokio::test]
async fn saturates_oversized_timeout() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    call(
        router.link(),
        procedure(),
        RpcCall {
            timeout: Some(Duration::MAX),
            ..Default::default()
        },
        false,
    )
    .await
    .unwrap();

    assert_matches::assert_matches!(router.next_sent().await, Message::Call(message) => {
        assert_eq!(message.options.get("timeout"), Some(&Value::Integer(u64::MAX)));
        assert!(message.options.get("receive_progress").is_none());
    });
}

#[tokio::test]
async fn concurrent_calls_only_receive_correlated_results() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let mut calls = Vec::new();
    for _ in 0..5 {
        calls.push(
            call(router.link(), procedure(), RpcCall::default(), false)
                .await
                .unwrap(),
        );
        router.next_sent().await;
    }

    // Reply in reverse order, with a few unrelated messages in between.
    for request in (1..=5).rev() {
        router.deliver(result_message(request + 100, 0, false));
        router.deliver(result_message(request, request * 10, false));
    }

    for (i, pending) in calls.into_iter().enumerate() {
        let request = i as u64 + 1;
        assert_eq!(pending.request_id(), id(request));
        assert_matches::assert_matches!(pending.result().await, Ok(result) => {
            pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(request * 10)]));
        });
    }
}

#[tokio::test]
async fn forwards_progress_results_then_completes() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let mut pending = call(router.link(), procedure(), RpcCall::default(), true)
        .await
        .unwrap();
    router.next_sent().await;

    router.deliver(result_message(1, 1, true));
    router.deliver(result_message(1, 2, false));
    // Nothing after the final result is observed.
    router.deliver(result_message(1, 3, false));

    assert_matches::assert_matches!(pending.next_result().await, Ok(Some(result)) => {
        assert!(result.progress);
        pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(1)]));
    });
    assert!(!pending.done());
    assert_matches::assert_matches!(pending.next_result().await, Ok(Some(result)) => {
        assert!(!result.progress);
        pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(2)]));
    });
    assert!(pending.done());
    assert_matches::assert_matches!(pending.next_result().await, Ok(None));
}

#[tokio::test]
async fn single_result_completes_call() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let pending = call(router.link(), procedure(), RpcCall::default(), false)
        .await
        .unwrap();
    router.next_sent().await;
    router.deliver(result_message(1, 5, false));

    let results = pending.into_stream().collect::<Vec<_>>().await;
    assert_eq!(results.len(), 1);
    assert_matches::assert_matches!(&results[0], Ok(RpcResult { arguments, progress: false, .. }) => {
        pretty_assertions::assert_eq!(arguments, &List::from_iter([Value::Integer(5)]));
    });
}

#[tokio::test]
async fn error_completes_call_with_wamp_error() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let pending = call(router.link(), procedure(), RpcCall::default(), true)
        .await
        .unwrap();
    router.next_sent().await;
    router.deliver(error_message(1, "wamp.error.no_such_procedure"));

    let results = pending.into_stream().collect::<Vec<_>>().await;
    assert_eq!(results.len(), 1);
    assert_matches::assert_matches!(&results[0], Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(error) => {
            assert_eq!(error.error.as_ref(), "wamp.error.no_such_procedure");
            assert_eq!(error.message(), Some("failed"));
            assert_matches::assert_matches!(
                error.interaction_error().and_then(|err| err.downcast::<InteractionError>().ok()),
                Some(InteractionError::NoSuchProcedure)
            );
        });
    });
}

#[tokio::test]
async fn error_after_final_result_is_ignored() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let mut pending = call(router.link(), procedure(), RpcCall::default(), false)
        .await
        .unwrap();
    router.next_sent().await;
    router.deliver(result_message(1, 5, false));
    router.deliver(error_message(1, "com.myapp.error"));

    assert_matches::assert_matches!(pending.next_result().await, Ok(Some(_)));
    assert_matches::assert_matches!(pending.next_result().await, Ok(None));
}

#[tokio::test]
async fn fails_immediately_when_send_fails() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new();
    assert_matches::assert_matches!(
        call(&router.failing_link(), procedure(), RpcCall::default(), false).await,
        Err(err) => {
            assert!(err.is::<PeerNotConnectedError>());
        }
    );
}

#[tokio::test]
async fn fails_when_connection_drops() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let pending = call(router.link(), procedure(), RpcCall::default(), false)
        .await
        .unwrap();
    router.next_sent().await;
    router.disconnect();

    assert_matches::assert_matches!(pending.result().await, Err(err) => {
        assert!(err.is::<PeerNotConnectedError>());
    });
}

#[tokio::test]
async fn dropping_call_sends_nothing() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::new();
    let pending = call(router.link(), procedure(), RpcCall::default(), false)
        .await
        .unwrap();
    router.next_sent().await;
    drop(pending);
    router.deliver(result_message(1, 5, false));
    router.assert_nothing_sent().await;
}

#[tokio::test]
async fn lagging_call_fails_instead_of_skipping_messages() {
    test_utils::setup::setup_test_environment();

    let mut router = TestRouter::with_buffer_size(2);
    let pending = call(router.link(), procedure(), RpcCall::default(), false)
        .await
        .unwrap();
    router.next_sent().await;

    for request in 100..105 {
        router.deliver(result_message(request, 0, false));
    }
    router.deliver(result_message(1, 5, false));

    assert_matches::assert_matches!(pending.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<MessageStreamLaggedError>(), Some(_));
    });
}
