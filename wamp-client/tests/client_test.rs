use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};
use wamp_client::{
    auth::wamp_cra::WampCraChallengeHandler,
    core::{
        error::{
            ChallengeError,
            ClientClosedError,
            PeerConnectionError,
            PeerNotConnectedError,
        },
        id::{
            Id,
            SequentialIdAllocator,
        },
        stream::DirectMessageStream,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        ChallengeMessage,
        EventMessage,
        GoodbyeMessage,
        HelloMessage,
        Message,
        ResultMessage,
        SubscribedMessage,
        WelcomeMessage,
    },
    peer::{
        ChallengeHandler,
        Client,
        ClientBuilder,
        DirectConnector,
        RpcCall,
        SubscriptionOptions,
    },
};

const WAIT: Duration = Duration::from_secs(5);

fn id(value: u64) -> Id {
    Id::try_from(value).unwrap()
}

fn realm() -> Uri {
    Uri::try_from("com.myapp.realm").unwrap()
}

/// The router end of a single client connection.
struct RouterConnection {
    to_client: UnboundedSender<Message>,
    from_client: UnboundedReceiver<Message>,
}

impl RouterConnection {
    fn send(&self, message: Message) {
        self.to_client.send(message).unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for the client")
    }

    async fn handshake(&mut self, session: u64) -> HelloMessage {
        let hello = match self.recv().await {
            Some(Message::Hello(hello)) => hello,
            message => panic!("expected HELLO, got {message:?}"),
        };
        self.send(Message::Welcome(WelcomeMessage {
            session: id(session),
            details: Dictionary::default(),
        }));
        hello
    }
}

fn direct_connector() -> (DirectConnector, UnboundedReceiver<RouterConnection>) {
    let (connection_tx, connection_rx) = unbounded_channel();
    let connector = DirectConnector::new(move || {
        let (to_client, client_rx) = unbounded_channel();
        let (client_tx, from_client) = unbounded_channel();
        connection_tx
            .send(RouterConnection {
                to_client,
                from_client,
            })
            .map_err(|_| Error::msg("router is gone"))?;
        Ok(DirectMessageStream::new(client_tx, client_rx))
    });
    (connector, connection_rx)
}

async fn next_connection(connection_rx: &mut UnboundedReceiver<RouterConnection>) -> RouterConnection {
    tokio::time::timeout(WAIT, connection_rx.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector is gone")
}

fn client_builder() -> ClientBuilder {
    let mut builder = ClientBuilder::new(realm()).id_allocator(SequentialIdAllocator::default());
    builder.config_mut().reconnect.delay = Duration::ZERO;
    builder
}

async fn wait_for_session(client: &Client, session: u64) {
    let mut session_rx = client.session_state_rx();
    tokio::time::timeout(
        WAIT,
        session_rx.wait_for(|state| state.session().is_some_and(|established| established.id == id(session))),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn establishes_session_and_calls_procedure() {
    test_utils::setup::setup_test_environment();

    let (connector, mut connection_rx) = direct_connector();
    let mut builder = client_builder();
    builder.config_mut().hello_details.insert(
        "authid".to_owned(),
        Value::String("joe".to_owned()),
    );
    let (client, _) = builder.start(connector);

    let mut connection = next_connection(&mut connection_rx).await;
    let hello = connection.handshake(1).await;
    assert_eq!(hello.realm, realm());
    assert_eq!(hello.details.get("authid"), Some(&Value::String("joe".to_owned())));
    assert_matches::assert_matches!(hello.details.get("agent"), Some(Value::String(agent)) => {
        assert!(agent.starts_with("wamp-client-"));
    });
    assert_matches::assert_matches!(hello.details.get("roles"), Some(Value::Dictionary(roles)) => {
        assert!(roles.contains_key("caller"));
    });

    assert_matches::assert_matches!(client.session().await, Ok(session) => {
        assert_eq!(session.id, id(1));
        assert_eq!(session.realm, realm());
    });
    assert_eq!(client.current_session().map(|session| session.id), Some(id(1)));

    let pending = client
        .call(
            Uri::try_from("com.myapp.add2").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(1), Value::Integer(2)]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Call(message)) => {
        assert_eq!(message.request, id(1));
        connection.send(Message::Result(ResultMessage {
            call_request: message.request,
            details: Dictionary::default(),
            yield_arguments: List::from_iter([Value::Integer(3)]),
            yield_arguments_keyword: Dictionary::default(),
        }));
    });
    assert_matches::assert_matches!(pending.result().await, Ok(result) => {
        pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::Integer(3)]));
    });
}

#[tokio::test]
async fn reconnects_after_connection_ends() {
    test_utils::setup::setup_test_environment();

    let (connector, mut connection_rx) = direct_connector();
    let (client, _) = client_builder().start(connector);

    let mut connection = next_connection(&mut connection_rx).await;
    connection.handshake(1).await;
    wait_for_session(&client, 1).await;

    let mut subscription = client
        .subscribe(
            Uri::try_from("com.myapp.topic").unwrap(),
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Subscribe(message)) => {
        connection.send(Message::Subscribed(SubscribedMessage {
            subscribe_request: message.request,
            subscription: id(7),
        }));
    });
    connection.send(Message::Event(EventMessage {
        subscribed_subscription: id(7),
        published_publication: id(1),
        ..Default::default()
    }));
    assert_matches::assert_matches!(subscription.next_event().await, Ok(Some(_)));

    // The router drops the connection.
    drop(connection);

    // Operations on the old connection fail, and are not restored.
    assert_matches::assert_matches!(subscription.next_event().await, Err(err) => {
        assert!(err.is::<PeerNotConnectedError>());
    });

    let mut connection = next_connection(&mut connection_rx).await;
    connection.handshake(2).await;
    wait_for_session(&client, 2).await;

    // Request IDs start over in the new session.
    let _pending = client
        .call(Uri::try_from("com.myapp.add2").unwrap(), RpcCall::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Call(message)) => {
        assert_eq!(message.request, id(1));
    });
}

#[tokio::test]
async fn replies_to_router_goodbye_and_reconnects() {
    test_utils::setup::setup_test_environment();

    let (connector, mut connection_rx) = direct_connector();
    let (client, _) = client_builder().start(connector);

    let mut connection = next_connection(&mut connection_rx).await;
    connection.handshake(1).await;
    wait_for_session(&client, 1).await;

    connection.send(Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: Uri::try_from("wamp.close.system_shutdown").unwrap(),
    }));
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Goodbye(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.close.goodbye_and_out");
    });
    assert_matches::assert_matches!(connection.recv().await, None);

    let mut connection = next_connection(&mut connection_rx).await;
    connection.handshake(2).await;
    wait_for_session(&client, 2).await;
}

#[tokio::test]
async fn close_sends_goodbye_and_stops_client() {
    test_utils::setup::setup_test_environment();

    let (connector, mut connection_rx) = direct_connector();
    let (client, join_handle) = client_builder().start(connector);

    let mut connection = next_connection(&mut connection_rx).await;
    connection.handshake(1).await;
    wait_for_session(&client, 1).await;

    assert_matches::assert_matches!(client.close().await, Ok(()));
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Goodbye(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.close.normal");
    });
    assert_matches::assert_matches!(tokio::time::timeout(WAIT, join_handle).await, Ok(Ok(())));

    assert_matches::assert_matches!(client.call(Uri::try_from("com.myapp.add2").unwrap(), RpcCall::default()).await, Err(err) => {
        assert!(err.is::<ClientClosedError>());
    });
    assert!(connection_rx.try_recv().is_err());
}

#[tokio::test]
async fn gives_up_after_max_consecutive_failures() {
    test_utils::setup::setup_test_environment();

    let connector = DirectConnector::new(|| Err(Error::msg("connection refused")));
    let mut builder = client_builder();
    builder.config_mut().reconnect.max_consecutive_failures = Some(2);
    let (client, join_handle) = builder.start(connector);
    let mut error_rx = client.error_rx();

    assert_matches::assert_matches!(tokio::time::timeout(WAIT, join_handle).await, Ok(Ok(())));
    assert_matches::assert_matches!(error_rx.recv().await, Ok(err) => {
        assert_matches::assert_matches!(err.into_error().downcast::<PeerConnectionError>(), Ok(error) => {
            assert_eq!(error.attempts, 3);
            assert_eq!(error.message, "connection refused");
        });
    });
    assert_matches::assert_matches!(client.session().await, Err(err) => {
        assert!(err.is::<PeerConnectionError>());
    });
}

#[tokio::test]
async fn answers_challenge_during_handshake() {
    test_utils::setup::setup_test_environment();

    let (connector, mut connection_rx) = direct_connector();
    let mut builder = client_builder().on_challenge(WampCraChallengeHandler::new("secret"));
    builder.config_mut().hello_details.insert(
        "authmethods".to_owned(),
        Value::List(List::from_iter([Value::String("wampcra".to_owned())])),
    );
    let (client, _) = builder.start(connector);

    let mut connection = next_connection(&mut connection_rx).await;
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Hello(_)));
    connection.send(Message::Challenge(ChallengeMessage {
        auth_method: "wampcra".to_owned(),
        extra: Dictionary::from_iter([(
            "challenge".to_owned(),
            Value::String("{\"nonce\":\"abc\"}".to_owned()),
        )]),
    }));
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Authenticate(message)) => {
        assert_eq!(message.signature.len(), 44);
    });
    connection.send(Message::Welcome(WelcomeMessage {
        session: id(1),
        details: Dictionary::default(),
    }));
    wait_for_session(&client, 1).await;
}

struct RejectingChallengeHandler;

#[async_trait]
impl ChallengeHandler for RejectingChallengeHandler {
    async fn handle_challenge(&self, _: &str, _: &Dictionary) -> Result<String> {
        Err(Error::msg("no credentials"))
    }
}

#[tokio::test]
async fn challenge_failure_aborts_handshake_and_stops_client() {
    test_utils::setup::setup_test_environment();

    let (connector, mut connection_rx) = direct_connector();
    let (client, join_handle) = client_builder()
        .on_challenge(RejectingChallengeHandler)
        .start(connector);
    let mut error_rx = client.error_rx();

    let mut connection = next_connection(&mut connection_rx).await;
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Hello(_)));
    let challenge = ChallengeMessage {
        auth_method: "ticket".to_owned(),
        extra: Dictionary::default(),
    };
    connection.send(Message::Challenge(challenge.clone()));
    assert_matches::assert_matches!(connection.recv().await, Some(Message::Abort(message)) => {
        assert_eq!(message.reason.as_ref(), "wamp.error.authentication_failed");
    });

    // No retry, even though reconnecting is unlimited.
    assert_matches::assert_matches!(tokio::time::timeout(WAIT, join_handle).await, Ok(Ok(())));
    assert!(connection_rx.try_recv().is_err());
    assert_matches::assert_matches!(error_rx.recv().await, Ok(err) => {
        assert_matches::assert_matches!(err.into_error().downcast::<ChallengeError>(), Ok(error) => {
            pretty_assertions::assert_eq!(error.challenge, challenge);
            assert_eq!(error.message, "no credentials");
        });
    });
    assert_matches::assert_matches!(client.session().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<ChallengeError>(), Some(error) => {
            assert_eq!(error.challenge.auth_method, "ticket");
        });
    });
}
