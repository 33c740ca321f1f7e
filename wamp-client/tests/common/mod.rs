#![allow(dead_code)]

use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use tokio::sync::{
    broadcast,
    mpsc,
};
use wamp_client::{
    core::{
        error::PeerNotConnectedError,
        id::{
            Id,
            SequentialIdAllocator,
        },
    },
    message::message::Message,
    peer::{
        Link,
        MessageSender,
    },
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn id(value: u64) -> Id {
    Id::try_from(value).unwrap()
}

/// Records every message sent through it.
struct RecordingSender {
    sent_tx: mpsc::UnboundedSender<Message>,
    fail_unregister: bool,
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: Message) -> Result<()> {
        let unregister = matches!(message, Message::Unregister(_));
        self.sent_tx
            .send(message)
            .map_err(|_| Error::from(PeerNotConnectedError))?;
        if unregister && self.fail_unregister {
            return Err(Error::msg("failed to write UNREGISTER"));
        }
        Ok(())
    }
}

/// Fails every send, as if the connection were gone.
pub struct FailingSender;

#[async_trait]
impl MessageSender for FailingSender {
    async fn send(&self, _: Message) -> Result<()> {
        Err(PeerNotConnectedError.into())
    }
}

/// Stands in for the router on the other end of a [`Link`].
///
/// Messages are delivered to every operation on the link, and messages sent by operations are
/// recorded in order.
pub struct TestRouter {
    message_tx: Option<broadcast::Sender<Message>>,
    sent_rx: mpsc::UnboundedReceiver<Message>,
    link: Link,
}

impl TestRouter {
    pub fn new() -> Self {
        Self::with_buffer_size(64)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self::build(buffer_size, false)
    }

    /// A router whose UNREGISTER messages are recorded, but fail to send.
    pub fn with_failing_unregister() -> Self {
        Self::build(64, true)
    }

    fn build(buffer_size: usize, fail_unregister: bool) -> Self {
        let (message_tx, message_rx) = broadcast::channel(buffer_size);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let link = Link::new(
            message_rx,
            Arc::new(RecordingSender {
                sent_tx,
                fail_unregister,
            }),
            Arc::new(SequentialIdAllocator::default()),
        );
        Self {
            message_tx: Some(message_tx),
            sent_rx,
            link,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// A link over the same message stream whose sends always fail.
    pub fn failing_link(&self) -> Link {
        Link::new(
            self.link.message_rx(),
            Arc::new(FailingSender),
            Arc::new(SequentialIdAllocator::default()),
        )
    }

    pub fn deliver(&self, message: Message) {
        self.message_tx
            .as_ref()
            .expect("connection is closed")
            .send(message)
            .unwrap();
    }

    /// Closes the message stream, as if the connection dropped.
    pub fn disconnect(&mut self) {
        self.message_tx = None;
    }

    pub async fn next_sent(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.sent_rx.recv())
            .await
            .expect("timed out waiting for a sent message")
            .expect("sender is gone")
    }

    pub async fn assert_nothing_sent(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_matches::assert_matches!(self.sent_rx.try_recv(), Err(_));
    }
}
