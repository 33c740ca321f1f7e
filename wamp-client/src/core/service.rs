use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    error,
    trace,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::{
            InteractionError,
            PeerNotConnectedError,
        },
        stream::{
            MessageStream,
            StreamMessage,
        },
    },
    message::{
        common::abort_message_for_error,
        message::Message,
    },
};

/// A message queued for sending, along with a channel for reporting when it was written out.
struct OutboundMessage {
    message: Message,
    sent_tx: oneshot::Sender<Result<()>>,
}

/// A cloneable handle for sending messages out through a running [`Service`].
#[derive(Clone)]
pub struct ServiceSender {
    outbound_tx: UnboundedSender<OutboundMessage>,
}

impl ServiceSender {
    /// Sends a message over the service's stream.
    ///
    /// Resolves once the message was written to the stream, so a failure to send is reported to
    /// the caller.
    pub async fn send(&self, message: Message) -> Result<()> {
        let (sent_tx, sent_rx) = oneshot::channel();
        self.outbound_tx
            .send(OutboundMessage { message, sent_tx })
            .map_err(|_| PeerNotConnectedError)?;
        sent_rx.await.map_err(|_| PeerNotConnectedError)?
    }
}

/// A handle to an asynchronously-running [`Service`].
pub struct ServiceHandle {
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
    outbound_tx: UnboundedSender<OutboundMessage>,
}

impl ServiceHandle {
    /// Joins the task running the service.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the service.
    ///
    /// Cancellation is the correct way to cleanly exit a service.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// A sender for messages going out over the service.
    pub fn sender(&self) -> ServiceSender {
        ServiceSender {
            outbound_tx: self.outbound_tx.clone(),
        }
    }
}

/// The asynchronous service that sends and receives WAMP messages over a single connection.
///
/// Every inbound message is broadcast to all subscribers of [`Service::message_rx`]. Subscribers
/// that fall more than the configured buffer size behind lose messages and observe a lag error.
/// When the connection ends, the broadcast channel closes, which all subscribers observe.
///
/// Errors are handled higher up in the stack. Canceling the service *will not* inject any message,
/// so the owner should send GOODBYE or ABORT before canceling.
pub struct Service {
    name: String,
    stream: Box<dyn MessageStream>,
    idle_timeout: Option<Duration>,
    message_tx: broadcast::Sender<Message>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
    cancel_tx: broadcast::Sender<()>,
    cancel_rx: broadcast::Receiver<()>,

    outbound_tx: UnboundedSender<OutboundMessage>,
    outbound_rx: UnboundedReceiver<OutboundMessage>,
}

impl Service {
    /// Creates a new service over the given stream.
    pub fn new(
        name: String,
        stream: Box<dyn MessageStream>,
        message_buffer_size: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let (message_tx, _) = broadcast::channel(message_buffer_size.max(1));
        let (end_tx, end_rx) = broadcast::channel(1);
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let (outbound_tx, outbound_rx) = unbounded_channel();
        Self {
            name,
            stream,
            idle_timeout,
            message_tx,
            end_tx,
            _end_rx: end_rx,
            cancel_tx,
            cancel_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    /// The message receiver channel.
    pub fn message_rx(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    /// The end receiver channel.
    pub fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }

    /// Starts the service asynchronously.
    ///
    /// This method takes ownership of the service. All future interactions with the service should
    /// be made through the returned handle.
    pub fn start(self) -> ServiceHandle {
        let cancel_tx = self.cancel_tx.clone();
        let outbound_tx = self.outbound_tx.clone();
        let start_handle = tokio::spawn(self.run());
        ServiceHandle {
            start_handle,
            cancel_tx,
            outbound_tx,
        }
    }

    async fn run(mut self) {
        debug!(
            "Service {} started over {} stream",
            self.name,
            self.stream.message_stream_type()
        );
        if let Err(err) = self.service_loop().await {
            error!("Service {} failed: {err:#}", self.name);
        }
        if let Err(err) = self.end().await {
            error!("Failed to end service {}: {err:#}", self.name);
        }
    }

    async fn idle(idle_timeout: Option<Duration>) {
        match idle_timeout {
            Some(idle_timeout) => tokio::time::sleep(idle_timeout).await,
            None => futures_util::future::pending().await,
        }
    }

    async fn service_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Ping(data))) => {
                            self.stream.send(StreamMessage::Ping(data)).await?;
                        }
                        Some(Ok(StreamMessage::Message(message))) => {
                            trace!("Service {} received {} (request = {:?})", self.name, message.message_name(), message.request_id());
                            // No receivers is not an error, since the message is simply unwanted.
                            self.message_tx.send(message).ok();
                        }
                        Some(Err(err)) => {
                            // The stream is closed abruptly, so nobody can know what the intent was.
                            self.stream.send(StreamMessage::Message(abort_message_for_error(&InteractionError::ProtocolViolation("stream abruptly closed".to_owned()).into()))).await.ok();
                            return Err(err);
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }
                outbound = self.outbound_rx.recv() => {
                    let OutboundMessage { message, sent_tx } = match outbound {
                        Some(outbound) => outbound,
                        None => return Err(Error::msg("outbound message stream closed")),
                    };
                    trace!("Service {} sending {}", self.name, message.message_name());
                    match self.stream.send(StreamMessage::Message(message)).await {
                        Ok(()) => {
                            sent_tx.send(Ok(())).ok();
                        }
                        Err(err) => {
                            sent_tx.send(Err(Error::msg(format!("{err:#}")))).ok();
                            return Err(err);
                        }
                    }
                }
                _ = self.cancel_rx.recv() => {
                    return Ok(());
                }
                // Timeout is implemented at this layer so that pings keep the connection alive.
                _ = Self::idle(self.idle_timeout) => {
                    return Err(Error::msg("timed out"));
                }
            }
        }
    }

    async fn end(&mut self) -> Result<()> {
        // The stream may already be closed.
        self.stream.close().await.ok();
        self.end_tx.send(())?;
        Ok(())
    }
}
