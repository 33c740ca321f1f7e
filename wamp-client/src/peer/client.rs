use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use tokio::{
    sync::{
        broadcast,
        watch,
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::{
            ChannelTransmittableError,
            ClientClosedError,
        },
        id::{
            IdAllocator,
            RandomIdAllocator,
        },
        types::Dictionary,
        uri::Uri,
    },
    peer::{
        call::{
            PendingRpc,
            RpcCall,
            RpcResult,
            call,
        },
        challenge::ChallengeHandler,
        connector::Connector,
        registration::{
            BasicProcedure,
            ExtendedProcedure,
            Procedure,
            ProcedureOptions,
            Registration,
            register,
        },
        session::{
            ActiveSession,
            EstablishedSession,
            SessionState,
            hello_details,
        },
        subscription::{
            Subscription,
            SubscriptionOptions,
            subscribe,
        },
        supervisor::{
            ReconnectConfig,
            Supervisor,
            SupervisorConfig,
        },
    },
};

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name of the client, announced to the router in HELLO.
    pub agent: String,
    /// Additional HELLO details, such as `authid` and `authmethods`.
    pub hello_details: Dictionary,
    pub reconnect: ReconnectConfig,
    /// The number of inbound messages buffered for each operation.
    ///
    /// An operation that falls further behind fails.
    pub message_buffer_size: usize,
    /// Closes a connection that received nothing for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_owned(),
            hello_details: Dictionary::default(),
            reconnect: ReconnectConfig::default(),
            message_buffer_size: 1024,
            idle_timeout: None,
        }
    }
}

/// A builder for a [`Client`].
pub struct ClientBuilder {
    realm: Uri,
    config: ClientConfig,
    id_allocator: Arc<dyn IdAllocator>,
    challenge_handler: Option<Arc<dyn ChallengeHandler>>,
}

impl ClientBuilder {
    /// Creates a builder for a client that joins the given realm.
    pub fn new(realm: Uri) -> Self {
        Self {
            realm,
            config: ClientConfig::default(),
            id_allocator: Arc::new(RandomIdAllocator::default()),
            challenge_handler: None,
        }
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// A mutable reference to the configuration.
    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Sets the allocator for request IDs.
    pub fn id_allocator<A>(mut self, id_allocator: A) -> Self
    where
        A: IdAllocator + 'static,
    {
        self.id_allocator = Arc::new(id_allocator);
        self
    }

    /// Sets the handler for authentication challenges.
    pub fn on_challenge<H>(mut self, handler: H) -> Self
    where
        H: ChallengeHandler + 'static,
    {
        self.challenge_handler = Some(Arc::new(handler));
        self
    }

    /// Starts the client in the background.
    ///
    /// The client connects and establishes a session right away. The returned handle finishes
    /// when the client is closed for good.
    pub fn start<C>(self, connector: C) -> (Client, JoinHandle<()>)
    where
        C: Connector + 'static,
    {
        let (session_tx, session_rx) = watch::channel(SessionState::Disconnected);
        let (error_tx, _) = broadcast::channel(16);
        let (close_tx, close_rx) = broadcast::channel(1);
        let supervisor = Supervisor::new(
            Box::new(connector),
            SupervisorConfig {
                hello_details: hello_details(&self.config.agent, &self.config.hello_details),
                realm: self.realm,
                reconnect: self.config.reconnect,
                message_buffer_size: self.config.message_buffer_size,
                idle_timeout: self.config.idle_timeout,
                id_allocator: self.id_allocator,
                challenge_handler: self.challenge_handler,
            },
            session_tx,
            error_tx.clone(),
        );
        let join_handle = tokio::spawn(supervisor.run(close_rx));
        (
            Client {
                session_rx,
                error_tx,
                close_tx,
            },
            join_handle,
        )
    }
}

/// A WAMP client acting as caller, callee, and subscriber in a single realm.
///
/// Every operation waits for a session before starting, and is bound to the connection it started
/// on. Dropping the client closes it.
pub struct Client {
    session_rx: watch::Receiver<SessionState>,
    error_tx: broadcast::Sender<ChannelTransmittableError>,
    close_tx: broadcast::Sender<()>,
}

impl Client {
    /// A receiver for the session state, which always observes the latest state first.
    pub fn session_state_rx(&self) -> watch::Receiver<SessionState> {
        self.session_rx.clone()
    }

    /// The current session, if one is established.
    pub fn current_session(&self) -> Option<EstablishedSession> {
        self.session_rx.borrow().session().cloned()
    }

    /// Waits for a session to be established.
    pub async fn session(&self) -> Result<EstablishedSession> {
        Ok(self.active_session().await?.session.clone())
    }

    /// A receiver for errors that stopped the client.
    pub fn error_rx(&self) -> broadcast::Receiver<ChannelTransmittableError> {
        self.error_tx.subscribe()
    }

    async fn active_session(&self) -> Result<Arc<ActiveSession>> {
        let mut session_rx = self.session_rx.clone();
        let state = session_rx
            .wait_for(|state| !matches!(state, SessionState::Disconnected))
            .await
            .map_err(|_| ClientClosedError)?;
        match &*state {
            SessionState::Established(active) => Ok(active.clone()),
            SessionState::Closed(Some(err)) => Err(err.clone().into_error()),
            _ => Err(ClientClosedError.into()),
        }
    }

    /// Calls a procedure.
    pub async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<PendingRpc> {
        let active = self.active_session().await?;
        call(&active.link, procedure, rpc_call, false).await
    }

    /// Calls a procedure and waits for its result.
    pub async fn call_and_wait(&self, procedure: Uri, rpc_call: RpcCall) -> Result<RpcResult> {
        self.call(procedure, rpc_call).await?.result().await
    }

    /// Calls a procedure, asking the callee for progressive results.
    pub async fn call_with_progress(
        &self,
        procedure: Uri,
        rpc_call: RpcCall,
    ) -> Result<PendingRpc> {
        let active = self.active_session().await?;
        call(&active.link, procedure, rpc_call, true).await
    }

    /// Registers a procedure that only receives positional arguments.
    pub async fn register<P>(
        &self,
        procedure: Uri,
        handler: P,
        options: ProcedureOptions,
    ) -> Result<Registration>
    where
        P: Procedure + 'static,
    {
        self.register_extended(procedure, BasicProcedure(handler), options)
            .await
    }

    /// Registers a procedure that receives the entire invocation.
    pub async fn register_extended<P>(
        &self,
        procedure: Uri,
        handler: P,
        options: ProcedureOptions,
    ) -> Result<Registration>
    where
        P: ExtendedProcedure + 'static,
    {
        let active = self.active_session().await?;
        register(&active.link, procedure, Arc::new(handler), options).await
    }

    /// Subscribes to a topic.
    pub async fn subscribe(&self, topic: Uri, options: SubscriptionOptions) -> Result<Subscription> {
        let active = self.active_session().await?;
        subscribe(&active.link, topic, options).await
    }

    /// Closes the client, leaving the current session.
    ///
    /// Resolves once the client is closed for good.
    pub async fn close(&self) -> Result<()> {
        // The supervisor may already be gone.
        self.close_tx.send(()).ok();
        let mut session_rx = self.session_rx.clone();
        session_rx
            .wait_for(|state| matches!(state, SessionState::Closed(_)))
            .await
            .ok();
        Ok(())
    }
}
