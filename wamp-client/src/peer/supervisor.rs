use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    error,
    info,
    warn,
};
use tokio::sync::{
    broadcast::{
        self,
        error::RecvError,
    },
    watch,
};
use uuid::Uuid;

use crate::{
    core::{
        close::CloseReason,
        error::{
            ChallengeError,
            ChannelTransmittableError,
            PeerConnectionError,
        },
        id::IdAllocator,
        service::{
            Service,
            ServiceHandle,
        },
        types::Dictionary,
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::Message,
    },
    peer::{
        challenge::{
            ChallengeHandler,
            ChallengeResponder,
        },
        connector::Connector,
        link::Link,
        session::{
            ActiveSession,
            EstablishedSession,
            SessionState,
            establish_session,
        },
    },
};

/// Configuration for reconnecting to the router.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// The delay between the end of a connection and the next connection attempt.
    pub delay: Duration,
    /// The maximum consecutive failed connection attempts to tolerate before giving up.
    ///
    /// `None` retries forever. A failed challenge is never retried.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_consecutive_failures: None,
        }
    }
}

/// Everything the supervisor needs to establish sessions.
pub(crate) struct SupervisorConfig {
    pub realm: Uri,
    pub hello_details: Dictionary,
    pub reconnect: ReconnectConfig,
    pub message_buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub id_allocator: Arc<dyn IdAllocator>,
    pub challenge_handler: Option<Arc<dyn ChallengeHandler>>,
}

/// A single connection to the router.
///
/// Dropping the connection cancels its service.
struct Connection {
    service_handle: ServiceHandle,
    end_rx: broadcast::Receiver<()>,
    message_rx: broadcast::Receiver<Message>,
    link: Link,
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The service may already be finished.
        self.service_handle.cancel().ok();
    }
}

/// How a connection ended.
enum ConnectionEnd {
    Lost,
    Closed,
}

/// Keeps a session with the router alive, reconnecting whenever the connection ends.
///
/// The current session is published on a watch channel. Closing the client or dropping every
/// close sender shuts the supervisor down.
pub(crate) struct Supervisor {
    connector: Box<dyn Connector>,
    config: SupervisorConfig,
    session_tx: watch::Sender<SessionState>,
    error_tx: broadcast::Sender<ChannelTransmittableError>,
}

impl Supervisor {
    pub fn new(
        connector: Box<dyn Connector>,
        config: SupervisorConfig,
        session_tx: watch::Sender<SessionState>,
        error_tx: broadcast::Sender<ChannelTransmittableError>,
    ) -> Self {
        Self {
            connector,
            config,
            session_tx,
            error_tx,
        }
    }

    pub async fn run(self, mut close_rx: broadcast::Receiver<()>) {
        let error = self.supervisor_loop(&mut close_rx).await;
        if let Some(err) = &error {
            error!("Client for realm {} stopped: {err}", self.config.realm);
            if let Err(err) = self.error_tx.send(err.clone()) {
                warn!("Failed to send client error over channel: {err}");
            }
        } else {
            info!("Client for realm {} closed", self.config.realm);
        }
        self.session_tx.send_replace(SessionState::Closed(error));
    }

    async fn supervisor_loop(
        &self,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> Option<ChannelTransmittableError> {
        let mut failures = 0;
        loop {
            self.session_tx.send_replace(SessionState::Disconnected);

            let result = tokio::select! {
                result = self.connect() => result,
                _ = close_rx.recv() => return None,
            };
            match result {
                Ok((mut connection, session)) => {
                    failures = 0;
                    self.session_tx
                        .send_replace(SessionState::Established(Arc::new(ActiveSession {
                            session,
                            link: connection.link.clone(),
                        })));
                    let end = Self::serve(&mut connection, close_rx).await;
                    self.session_tx.send_replace(SessionState::Disconnected);
                    if let ConnectionEnd::Closed = end {
                        return None;
                    }
                    info!(
                        "Session in realm {} ended, reconnecting",
                        self.config.realm
                    );
                }
                Err(err) if err.downcast_ref::<ChallengeError>().is_some() => {
                    // Authentication failures are terminal.
                    error!(
                        "Failed to authenticate in realm {}: {err:#}",
                        self.config.realm
                    );
                    return Some(err.into());
                }
                Err(err) => {
                    failures += 1;
                    error!(
                        "Failed to establish session in realm {} ({failures} consecutive failure(s)): {err:#}",
                        self.config.realm
                    );
                    if self
                        .config
                        .reconnect
                        .max_consecutive_failures
                        .is_some_and(|max| failures > max)
                    {
                        return Some(
                            Error::from(PeerConnectionError {
                                attempts: failures,
                                message: format!("{err:#}"),
                            })
                            .into(),
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect.delay) => (),
                _ = close_rx.recv() => return None,
            }
        }
    }

    async fn connect(&self) -> Result<(Connection, EstablishedSession)> {
        let stream = self.connector.connect().await?;
        let service = Service::new(
            format!("client-{}", Uuid::new_v4()),
            stream,
            self.config.message_buffer_size,
            self.config.idle_timeout,
        );
        let message_rx = service.message_rx();
        let end_rx = service.end_rx();
        let service_handle = service.start();

        // Request IDs are scoped to the session.
        self.config.id_allocator.reset().await;
        let link = Link::new(
            message_rx.resubscribe(),
            Arc::new(service_handle.sender()),
            self.config.id_allocator.clone(),
        );
        let connection = Connection {
            service_handle,
            end_rx,
            message_rx,
            link,
        };

        let mut responder = self
            .config
            .challenge_handler
            .clone()
            .map(|handler| ChallengeResponder::arm(&connection.link, handler));
        let session = {
            let establish = establish_session(
                &connection.link,
                self.config.realm.clone(),
                self.config.hello_details.clone(),
            );
            tokio::pin!(establish);
            loop {
                tokio::select! {
                    session = &mut establish => break session?,
                    result = Self::challenge_finished(&mut responder) => {
                        if let Err(err) = result {
                            connection.link.send(abort_message_for_error(&err)).await.ok();
                            return Err(err);
                        }
                    }
                }
            }
        };
        Ok((connection, session))
    }

    async fn challenge_finished(responder: &mut Option<ChallengeResponder>) -> Result<()> {
        match responder {
            Some(responder) => responder.finished().await,
            None => futures_util::future::pending().await,
        }
    }

    async fn serve(
        connection: &mut Connection,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> ConnectionEnd {
        loop {
            tokio::select! {
                _ = connection.end_rx.recv() => return ConnectionEnd::Lost,
                message = connection.message_rx.recv() => {
                    match message {
                        Ok(Message::Abort(message)) => {
                            warn!("Router aborted session: {}", message.reason);
                            return ConnectionEnd::Lost;
                        }
                        Ok(Message::Goodbye(message)) => {
                            info!("Router closed session: {}", message.reason);
                            connection.link.send(goodbye_and_out()).await.ok();
                            return ConnectionEnd::Lost;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => (),
                        Err(RecvError::Closed) => return ConnectionEnd::Lost,
                    }
                }
                _ = close_rx.recv() => {
                    if let Err(err) = connection
                        .link
                        .send(goodbye_with_close_reason(CloseReason::Normal))
                        .await
                    {
                        warn!("Failed to send GOODBYE: {err:#}");
                    }
                    return ConnectionEnd::Closed;
                }
            }
        }
    }
}
