use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use log::{
    info,
    trace,
};

use crate::{
    core::{
        error::{
            ChannelTransmittableError,
            InteractionError,
            WampError,
        },
        id::Id,
        roles::{
            PeerRole,
            roles_dictionary,
        },
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        HelloMessage,
        Message,
    },
    peer::link::{
        Link,
        next_message,
    },
};

/// A session established with a router in some realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedSession {
    pub id: Id,
    pub realm: Uri,
    /// Details sent by the router in WELCOME.
    pub details: Dictionary,
}

/// A session along with the connection it was established over.
///
/// Operations are only valid for as long as the connection lives.
pub struct ActiveSession {
    pub session: EstablishedSession,
    pub link: Link,
}

/// The session state of a client, replayed to every new observer.
#[derive(Default, Clone)]
pub enum SessionState {
    /// No session is established, but one may be in the future.
    #[default]
    Disconnected,
    Established(Arc<ActiveSession>),
    /// The client is closed for good, with the error that closed it, if any.
    Closed(Option<ChannelTransmittableError>),
}

impl SessionState {
    /// The established session, if any.
    pub fn session(&self) -> Option<&EstablishedSession> {
        match self {
            Self::Established(active) => Some(&active.session),
            _ => None,
        }
    }
}

/// HELLO details for the client.
///
/// Announces the agent and the client roles. Entries in `details` take precedence.
pub fn hello_details(agent: &str, details: &Dictionary) -> Dictionary {
    let mut hello_details = Dictionary::from_iter([
        ("agent".to_owned(), Value::String(agent.to_owned())),
        (
            "roles".to_owned(),
            Value::Dictionary(roles_dictionary(PeerRole::all())),
        ),
    ]);
    hello_details.extend(details.iter().map(|(key, value)| (key.clone(), value.clone())));
    hello_details
}

/// Establishes a session in the given realm by sending HELLO and waiting for WELCOME.
///
/// Any CHALLENGE sent by the router in the meantime must be answered separately.
pub async fn establish_session(
    link: &Link,
    realm: Uri,
    details: Dictionary,
) -> Result<EstablishedSession> {
    let mut message_rx = link.message_rx();
    link.send(Message::Hello(HelloMessage {
        realm: realm.clone(),
        details,
    }))
    .await?;

    loop {
        match next_message(&mut message_rx).await? {
            Message::Welcome(message) => {
                info!("Established session {} in realm {realm}", message.session);
                return Ok(EstablishedSession {
                    id: message.session,
                    realm,
                    details: message.details,
                });
            }
            Message::Abort(message) => {
                return Err(Error::from(WampError {
                    error: message.reason,
                    details: message.details,
                    arguments: message.arguments,
                    arguments_keyword: message.arguments_keyword,
                })
                .context(format!("router aborted session in realm {realm}")));
            }
            Message::Goodbye(_) => {
                return Err(InteractionError::ProtocolViolation(
                    "received GOODBYE before WELCOME".to_owned(),
                )
                .into());
            }
            message => {
                trace!(
                    "Ignoring {} while establishing session",
                    message.message_name()
                );
            }
        }
    }
}
