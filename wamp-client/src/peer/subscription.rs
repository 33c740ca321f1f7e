use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Stream,
    StreamExt,
};
use log::{
    debug,
    warn,
};
use tokio::sync::{
    broadcast,
    mpsc,
    oneshot,
};

use crate::{
    core::{
        error::{
            ChannelTransmittableResult,
            WampError,
        },
        id::Id,
        match_style::MatchStyle,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        Message,
        SubscribeMessage,
        UnsubscribeMessage,
    },
    peer::link::{
        Link,
        next_message,
    },
};

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionOptions {
    /// How the subscription should be matched for published events.
    pub match_style: MatchStyle,
    /// Additional options sent in SUBSCRIBE.
    pub options: Dictionary,
}

impl SubscriptionOptions {
    fn into_dictionary(self) -> Dictionary {
        let mut options = self.options;
        if let Some(match_style) = self.match_style.option_value() {
            options.insert("match".to_owned(), Value::String(match_style.to_owned()));
        }
        options
    }
}

/// An event received for a subscription.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
    pub publication: Id,
}

#[derive(Debug)]
enum SubscriptionMessage {
    Subscribed(Id),
    Event(ReceivedEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Subscribing,
    Subscribed { subscription: Id },
    Unsubscribing { subscription: Id },
    Unsubscribed,
    Errored,
}

impl SubscriptionState {
    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Subscribing, Self::Subscribed { .. }) => true,
            (Self::Subscribing, Self::Unsubscribed) => true,
            (Self::Subscribing, Self::Errored) => true,
            (Self::Subscribed { .. }, Self::Unsubscribing { .. }) => true,
            (Self::Subscribed { .. }, Self::Errored) => true,
            (Self::Unsubscribing { .. }, Self::Unsubscribed) => true,
            _ => false,
        }
    }
}

/// A subscription to a topic.
///
/// Dropping the subscription unsubscribes from the topic in the background.
pub struct Subscription {
    request_id: Id,
    id: Option<Id>,
    message_rx: mpsc::UnboundedReceiver<ChannelTransmittableResult<SubscriptionMessage>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// The request ID of the SUBSCRIBE message.
    pub fn request_id(&self) -> Id {
        self.request_id
    }

    /// The subscription ID, once the router confirmed the subscription.
    pub fn id(&self) -> Option<Id> {
        self.id
    }

    async fn next_message(&mut self) -> Result<Option<SubscriptionMessage>> {
        match self.message_rx.recv().await {
            Some(Ok(message)) => {
                if let SubscriptionMessage::Subscribed(id) = message {
                    self.id = Some(id);
                }
                Ok(Some(message))
            }
            Some(Err(err)) => Err(err.into_error()),
            None => Ok(None),
        }
    }

    /// Waits until the router confirms the subscription.
    pub async fn subscribed(&mut self) -> Result<Id> {
        if let Some(id) = self.id {
            return Ok(id);
        }
        match self.next_message().await? {
            Some(SubscriptionMessage::Subscribed(id)) => Ok(id),
            _ => Err(Error::msg("subscription ended before it was subscribed")),
        }
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription ended.
    pub async fn next_event(&mut self) -> Result<Option<ReceivedEvent>> {
        loop {
            match self.next_message().await? {
                Some(SubscriptionMessage::Subscribed(_)) => continue,
                Some(SubscriptionMessage::Event(event)) => return Ok(Some(event)),
                None => return Ok(None),
            }
        }
    }

    /// Wraps the subscription as a stream of events.
    ///
    /// The stream is finished when the subscription ends or fails.
    pub fn into_stream(self) -> impl Stream<Item = Result<ReceivedEvent>> {
        futures_util::stream::unfold(Some(self), move |subscription| async {
            let mut subscription = subscription?;
            match subscription.next_event().await {
                Ok(Some(event)) => Some((Ok(event), Some(subscription))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    /// Unsubscribes from the topic.
    ///
    /// Resolves once UNSUBSCRIBE was sent, without waiting for the router to acknowledge it.
    /// Events received in the meantime are discarded.
    pub async fn unsubscribe(mut self) -> Result<()> {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            cancel_tx.send(()).ok();
        }
        while self.next_message().await?.is_some() {}
        Ok(())
    }
}

/// Subscribes to a topic.
///
/// Fails immediately if the SUBSCRIBE message could not be sent. Otherwise, events are correlated
/// in the background and read through the returned [`Subscription`].
pub async fn subscribe(
    link: &Link,
    topic: Uri,
    options: SubscriptionOptions,
) -> Result<Subscription> {
    let request_id = link.generate_id().await;
    let message_rx = link.message_rx();
    link.send(Message::Subscribe(SubscribeMessage {
        request: request_id,
        options: options.into_dictionary(),
        topic: topic.clone(),
    }))
    .await?;

    let (message_tx, subscription_message_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let task = SubscriptionTask {
        link: link.clone(),
        topic,
        request_id,
        message_tx,
        state: SubscriptionState::Subscribing,
    };
    tokio::spawn(task.run(message_rx, cancel_rx));

    Ok(Subscription {
        request_id,
        id: None,
        message_rx: subscription_message_rx,
        cancel_tx: Some(cancel_tx),
    })
}

struct SubscriptionTask {
    link: Link,
    topic: Uri,
    request_id: Id,
    message_tx: mpsc::UnboundedSender<ChannelTransmittableResult<SubscriptionMessage>>,
    state: SubscriptionState,
}

impl SubscriptionTask {
    async fn run(
        mut self,
        mut message_rx: broadcast::Receiver<Message>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        if let Err(err) = self.subscription_loop(&mut message_rx, cancel_rx).await {
            debug!("Subscription to {} failed: {err:#}", self.topic);
            self.transition(SubscriptionState::Errored);
            self.message_tx.send(Err(err.into())).ok();
        }
    }

    fn transition(&mut self, next: SubscriptionState) {
        if self.state.allowed_state_transition(&next) {
            debug!(
                "Subscription to {} transitioned from {:?} to {next:?}",
                self.topic, self.state
            );
            self.state = next;
        }
    }

    async fn unsubscribe(&mut self) {
        if let SubscriptionState::Subscribed { subscription } = self.state {
            self.transition(SubscriptionState::Unsubscribing { subscription });
            let request = self.link.generate_id().await;
            if let Err(err) = self
                .link
                .send(Message::Unsubscribe(UnsubscribeMessage {
                    request,
                    subscribed_subscription: subscription,
                }))
                .await
            {
                warn!("Failed to unsubscribe from {}: {err:#}", self.topic);
            }
        }
        // The acknowledgement is not awaited.
        self.transition(SubscriptionState::Unsubscribed);
    }

    fn handle_message(&mut self, message: Message) -> Result<()> {
        match (self.state, message) {
            (SubscriptionState::Subscribing, Message::Subscribed(message))
                if message.subscribe_request == self.request_id =>
            {
                self.transition(SubscriptionState::Subscribed {
                    subscription: message.subscription,
                });
                self.message_tx
                    .send(Ok(SubscriptionMessage::Subscribed(message.subscription)))
                    .ok();
            }
            (SubscriptionState::Subscribing, Message::Error(message))
                if message.request == self.request_id =>
            {
                return Err(WampError::from(message).into());
            }
            (SubscriptionState::Subscribed { subscription }, Message::Event(message))
                if message.subscribed_subscription == subscription =>
            {
                self.message_tx
                    .send(Ok(SubscriptionMessage::Event(ReceivedEvent {
                        arguments: message.publish_arguments,
                        arguments_keyword: message.publish_arguments_keyword,
                        details: message.details,
                        publication: message.published_publication,
                    })))
                    .ok();
            }
            _ => (),
        }
        Ok(())
    }

    async fn subscription_loop(
        &mut self,
        message_rx: &mut broadcast::Receiver<Message>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                // Dropping the handle counts as cancellation.
                _ = &mut cancel_rx => {
                    self.unsubscribe().await;
                    return Ok(());
                }
                message = next_message(message_rx) => {
                    self.handle_message(message?)?;
                }
            }
        }
    }
}
