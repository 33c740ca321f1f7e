use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::{
    self,
    error::RecvError,
};

use crate::{
    core::{
        error::{
            MessageStreamLaggedError,
            PeerNotConnectedError,
        },
        id::{
            Id,
            IdAllocator,
        },
        service::ServiceSender,
    },
    message::message::Message,
};

/// A sink for messages going out to the router.
///
/// Resolves once the message was handed to the transport.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

#[async_trait]
impl MessageSender for ServiceSender {
    async fn send(&self, message: Message) -> Result<()> {
        ServiceSender::send(self, message).await
    }
}

/// Everything an operation needs to talk to the router over one connection.
///
/// Holds the shared inbound message stream, the outbound sender, and the request ID allocator.
/// Each operation takes its own receiver from [`Link::message_rx`], which sees every message
/// received after the call.
pub struct Link {
    message_rx: broadcast::Receiver<Message>,
    sender: Arc<dyn MessageSender>,
    id_allocator: Arc<dyn IdAllocator>,
}

impl Link {
    pub fn new(
        message_rx: broadcast::Receiver<Message>,
        sender: Arc<dyn MessageSender>,
        id_allocator: Arc<dyn IdAllocator>,
    ) -> Self {
        Self {
            message_rx,
            sender,
            id_allocator,
        }
    }

    /// A new receiver over the inbound message stream.
    pub fn message_rx(&self) -> broadcast::Receiver<Message> {
        self.message_rx.resubscribe()
    }

    /// The outbound sender.
    pub fn sender(&self) -> Arc<dyn MessageSender> {
        self.sender.clone()
    }

    /// Sends a message to the router.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    /// Generates a new request ID.
    pub async fn generate_id(&self) -> Id {
        self.id_allocator.generate_id().await
    }
}

impl Clone for Link {
    fn clone(&self) -> Self {
        Self {
            message_rx: self.message_rx.resubscribe(),
            sender: self.sender.clone(),
            id_allocator: self.id_allocator.clone(),
        }
    }
}

/// Waits for the next inbound message.
///
/// The stream closing means the connection is gone, which fails with [`PeerNotConnectedError`].
pub async fn next_message(message_rx: &mut broadcast::Receiver<Message>) -> Result<Message> {
    match message_rx.recv().await {
        Ok(message) => Ok(message),
        Err(RecvError::Closed) => Err(PeerNotConnectedError.into()),
        Err(RecvError::Lagged(skipped)) => Err(MessageStreamLaggedError { skipped }.into()),
    }
}
