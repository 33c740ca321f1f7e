use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::{
    debug,
    trace,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
};

use crate::{
    core::{
        error::ChallengeError,
        types::Dictionary,
    },
    message::message::{
        AuthenticateMessage,
        ChallengeMessage,
        Message,
    },
    peer::link::{
        Link,
        next_message,
    },
};

/// A handler for CHALLENGE messages sent by the router during the handshake.
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// Produces the signature for a challenge.
    async fn handle_challenge(&self, auth_method: &str, extra: &Dictionary) -> Result<String>;
}

/// Responds to a single CHALLENGE on a connection.
///
/// Dropping the responder stops waiting for the challenge.
pub struct ChallengeResponder {
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl Drop for ChallengeResponder {
    fn drop(&mut self) {
        if let Some(join_handle) = &self.join_handle {
            join_handle.abort();
        }
    }
}

impl ChallengeResponder {
    /// Starts waiting for a challenge.
    ///
    /// Messages are observed from the moment this method returns, so the responder should be
    /// armed before sending HELLO.
    pub fn arm(link: &Link, handler: Arc<dyn ChallengeHandler>) -> Self {
        let message_rx = link.message_rx();
        let join_handle = tokio::spawn(respond_to_challenge(link.clone(), handler, message_rx));
        Self {
            join_handle: Some(join_handle),
        }
    }

    /// Waits for the challenge to be answered.
    ///
    /// Fails with [`ChallengeError`] if the handler could not produce a signature. Once finished,
    /// the responder never finishes again.
    pub async fn finished(&mut self) -> Result<()> {
        match &mut self.join_handle {
            Some(join_handle) => {
                let result = join_handle.await.map_err(Error::new);
                self.join_handle = None;
                result?
            }
            None => futures_util::future::pending().await,
        }
    }
}

async fn respond_to_challenge(
    link: Link,
    handler: Arc<dyn ChallengeHandler>,
    mut message_rx: broadcast::Receiver<Message>,
) -> Result<()> {
    let challenge = loop {
        match next_message(&mut message_rx).await? {
            Message::Challenge(message) => break message,
            message => trace!(
                "Ignoring {} while waiting for challenge",
                message.message_name()
            ),
        }
    };
    debug!("Received {} challenge", challenge.auth_method);
    let signature = sign(handler.as_ref(), challenge).await?;
    link.send(Message::Authenticate(AuthenticateMessage {
        signature,
        extra: Dictionary::default(),
    }))
    .await
}

async fn sign(handler: &dyn ChallengeHandler, challenge: ChallengeMessage) -> Result<String> {
    match handler
        .handle_challenge(&challenge.auth_method, &challenge.extra)
        .await
    {
        Ok(signature) => Ok(signature),
        Err(err) => Err(ChallengeError {
            message: format!("{err:#}"),
            challenge,
        }
        .into()),
    }
}
