use std::fmt::Display;

use anyhow::Error;
use thiserror::Error;

use crate::{
    core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        ChallengeMessage,
        ErrorMessage,
    },
};

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed based on process configuration.
    #[error("{0}")]
    NotAllowed(String),
    /// The operation is not allowed based on user permissions.
    #[error("{0}")]
    PermissionDenied(String),
    /// Some internal error occurred.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error defined by the WAMP standard.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// The role being referenced does not exist.
    #[error("no such role")]
    NoSuchRole,
    /// The call was canceled.
    #[error("canceled")]
    Canceled,
    /// Authentication was rejected.
    #[error("authentication failed")]
    AuthenticationFailed,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::NoSuchRole => "no_such_role",
            Self::Canceled => "canceled",
            Self::AuthenticationFailed => "authentication_failed",
        }
    }
}

/// Creates an [`struct@Error`] from a URI error reason and message.
///
/// Unknown reasons produce [`BasicError::Internal`].
pub fn error_from_uri_reason_and_message(reason: Uri, message: String) -> Error {
    match reason.as_ref() {
        "wamp.error.not_found" => BasicError::NotFound(message).into(),
        "wamp.error.invalid_argument" => BasicError::InvalidArgument(message).into(),
        "wamp.error.not_allowed" => BasicError::NotAllowed(message).into(),
        "wamp.error.permission_denied" => BasicError::PermissionDenied(message).into(),
        "wamp.error.protocol_violation" => InteractionError::ProtocolViolation(message).into(),
        "wamp.error.no_such_procedure" => InteractionError::NoSuchProcedure.into(),
        "wamp.error.procedure_already_exists" => InteractionError::ProcedureAlreadyExists.into(),
        "wamp.error.no_such_registration" => InteractionError::NoSuchRegistration.into(),
        "wamp.error.no_such_subscription" => InteractionError::NoSuchSubscription.into(),
        "wamp.error.no_such_realm" => InteractionError::NoSuchRealm.into(),
        "wamp.error.no_such_role" => InteractionError::NoSuchRole.into(),
        "wamp.error.canceled" => InteractionError::Canceled.into(),
        "wamp.error.authentication_failed" => InteractionError::AuthenticationFailed.into(),
        _ => BasicError::Internal(message).into(),
    }
}

/// An ERROR reply from the router, correlated to one of this client's requests.
///
/// Carries the error URI and application payload as they were received.
#[derive(Debug, Default, Clone, PartialEq, Eq, Error)]
pub struct WampError {
    pub error: Uri,
    pub details: Dictionary,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl WampError {
    pub fn new(error: Uri) -> Self {
        Self {
            error,
            ..Default::default()
        }
    }

    /// Attaches a human-readable message as the first positional argument.
    pub fn with_message<S>(mut self, message: S) -> Self
    where
        S: Into<String>,
    {
        self.arguments.insert(0, Value::String(message.into()));
        self
    }

    /// The human-readable message of the error, if one was sent.
    ///
    /// Looks at the `message` detail first, then at the first positional argument.
    pub fn message(&self) -> Option<&str> {
        self.details
            .get("message")
            .and_then(|value| value.string())
            .or_else(|| self.arguments.first().and_then(|value| value.string()))
    }

    /// Converts the error to a standard WAMP interaction error, if its URI is a well-known one.
    pub fn interaction_error(&self) -> Option<Error> {
        if !self.error.as_ref().starts_with("wamp.error.") {
            return None;
        }
        Some(error_from_uri_reason_and_message(
            self.error.clone(),
            self.message().unwrap_or_default().to_owned(),
        ))
    }
}

impl Display for WampError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{}: {message}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl From<ErrorMessage> for WampError {
    fn from(value: ErrorMessage) -> Self {
        Self {
            error: value.error,
            details: value.details,
            arguments: value.arguments,
            arguments_keyword: value.arguments_keyword,
        }
    }
}

/// Error for a procedure handler failing to produce a result for an invocation.
#[derive(Debug, Clone, Error)]
#[error("invocation {request} failed with {error}: {message}")]
pub struct InvocationError {
    pub request: Id,
    pub error: Uri,
    pub message: String,
}

/// Error for a challenge callback failing to produce a signature.
///
/// Kept distinct from other errors so that authentication failures can be told apart from
/// transport failures.
#[derive(Debug, Clone, Error)]
#[error("failed to respond to {} challenge: {message}", challenge.auth_method)]
pub struct ChallengeError {
    pub challenge: ChallengeMessage,
    pub message: String,
}

/// Error for an operation that requires a connection when there is none.
#[derive(Debug, Clone, Error)]
#[error("peer is not connected")]
pub struct PeerNotConnectedError;

/// Error for a consumer of the shared message stream falling too far behind.
#[derive(Debug, Clone, Error)]
#[error("message stream lagged behind by {skipped} message(s)")]
pub struct MessageStreamLaggedError {
    pub skipped: u64,
}

/// Error for failing to connect to a router too many times in a row.
#[derive(Debug, Clone, Error)]
#[error("failed to connect to router after {attempts} attempt(s): {message}")]
pub struct PeerConnectionError {
    pub attempts: u32,
    pub message: String,
}

/// Error for the client being closed.
#[derive(Debug, Error)]
#[error("client is closed")]
pub struct ClientClosedError;

/// Concrete errors kept intact when transmitted over channels.
#[derive(Debug, Clone)]
enum TransmittedError {
    Wamp(WampError),
    Invocation(InvocationError),
    Challenge(ChallengeError),
    PeerConnection(PeerConnectionError),
    PeerNotConnected(PeerNotConnectedError),
    MessageStreamLagged(MessageStreamLaggedError),
}

/// An error that can be transmitted over channels.
#[derive(Debug, Clone)]
pub struct ChannelTransmittableError {
    pub reason: Uri,
    pub message: String,
    pub request_id: Option<Id>,
    source: Option<TransmittedError>,
}

impl ChannelTransmittableError {
    /// Converts the error into a real Error object that can be returned out.
    ///
    /// Errors received from the router and the errors of this crate that callers match on are
    /// restored to their original type.
    pub fn into_error(self) -> Error {
        match self.source {
            Some(TransmittedError::Wamp(error)) => error.into(),
            Some(TransmittedError::Invocation(error)) => error.into(),
            Some(TransmittedError::Challenge(error)) => error.into(),
            Some(TransmittedError::PeerConnection(error)) => error.into(),
            Some(TransmittedError::PeerNotConnected(error)) => error.into(),
            Some(TransmittedError::MessageStreamLagged(error)) => error.into(),
            None => error_from_uri_reason_and_message(self.reason, self.message),
        }
    }
}

impl From<&Error> for ChannelTransmittableError {
    fn from(value: &Error) -> Self {
        let source = if let Some(error) = value.downcast_ref::<WampError>() {
            Some(TransmittedError::Wamp(error.clone()))
        } else if let Some(error) = value.downcast_ref::<InvocationError>() {
            Some(TransmittedError::Invocation(error.clone()))
        } else if let Some(error) = value.downcast_ref::<ChallengeError>() {
            Some(TransmittedError::Challenge(error.clone()))
        } else if let Some(error) = value.downcast_ref::<PeerConnectionError>() {
            Some(TransmittedError::PeerConnection(error.clone()))
        } else if let Some(error) = value.downcast_ref::<PeerNotConnectedError>() {
            Some(TransmittedError::PeerNotConnected(error.clone()))
        } else if let Some(error) = value.downcast_ref::<MessageStreamLaggedError>() {
            Some(TransmittedError::MessageStreamLagged(error.clone()))
        } else {
            None
        };
        Self {
            reason: Uri::for_error(value),
            message: format!("{value:#}"),
            request_id: value
                .downcast_ref::<InvocationError>()
                .map(|error| error.request),
            source,
        }
    }
}

impl From<Error> for ChannelTransmittableError {
    fn from(value: Error) -> Self {
        Self::from(&value)
    }
}

impl Display for ChannelTransmittableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.reason)
    }
}

/// Type alias for a channel-transmittable result.
pub type ChannelTransmittableResult<T> = Result<T, ChannelTransmittableError>;

#[cfg(test)]
mod error_test {
    use crate::core::{
        error::{
            BasicError,
            ChannelTransmittableError,
            InteractionError,
            InvocationError,
            WampError,
        },
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    };

    #[test]
    fn formats_wamp_error_with_message() {
        let error = WampError {
            error: Uri::try_from("com.myapp.error.overflow").unwrap(),
            arguments: List::from_iter([Value::String("too big".to_owned())]),
            ..Default::default()
        };
        assert_eq!(error.to_string(), "com.myapp.error.overflow: too big");
        assert_eq!(
            WampError::new(Uri::try_from("com.myapp.error.empty").unwrap()).to_string(),
            "com.myapp.error.empty"
        );
    }

    #[test]
    fn prefers_message_detail_over_arguments() {
        let error = WampError {
            error: Uri::try_from("wamp.error.invalid_argument").unwrap(),
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String("from details".to_owned()),
            )]),
            arguments: List::from_iter([Value::String("from arguments".to_owned())]),
            ..Default::default()
        };
        assert_eq!(error.message(), Some("from details"));
        assert_matches::assert_matches!(error.interaction_error(), Some(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<BasicError>(), Some(BasicError::InvalidArgument(message)) => {
                assert_eq!(message, "from details");
            });
        });
    }

    #[test]
    fn application_errors_have_no_interaction_error() {
        let error = WampError::new(Uri::try_from("com.myapp.error").unwrap());
        assert_matches::assert_matches!(error.interaction_error(), None);
    }

    #[test]
    fn channel_transmittable_error_restores_wamp_error() {
        let original = WampError::new(Uri::try_from("com.myapp.error.busy").unwrap())
            .with_message("try later");
        let transmitted = ChannelTransmittableError::from(anyhow::Error::from(original.clone()));
        assert_eq!(transmitted.reason.as_ref(), "com.myapp.error.busy");
        assert_matches::assert_matches!(transmitted.into_error().downcast::<WampError>(), Ok(error) => {
            pretty_assertions::assert_eq!(error, original);
        });
    }

    #[test]
    fn channel_transmittable_error_restores_invocation_error() {
        let transmitted = ChannelTransmittableError::from(anyhow::Error::from(InvocationError {
            request: Id::try_from(44).unwrap(),
            error: Uri::try_from("wamp.error.internal").unwrap(),
            message: "handler failed".to_owned(),
        }));
        assert_eq!(transmitted.request_id, Some(Id::try_from(44).unwrap()));
        assert_matches::assert_matches!(transmitted.into_error().downcast::<InvocationError>(), Ok(error) => {
            assert_eq!(error.message, "handler failed");
        });
    }

    #[test]
    fn channel_transmittable_error_restores_interaction_error() {
        let transmitted =
            ChannelTransmittableError::from(anyhow::Error::from(InteractionError::NoSuchRealm));
        assert_matches::assert_matches!(
            transmitted.into_error().downcast_ref::<InteractionError>(),
            Some(InteractionError::NoSuchRealm)
        );
    }
}
