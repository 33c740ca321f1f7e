use anyhow::Error;

use crate::{
    core::{
        close::CloseReason,
        error::WampError,
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

fn message_details(error: &Error) -> Dictionary {
    Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))])
}

pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: message_details(error),
        reason: Uri::for_error(error),
        ..Default::default()
    })
}

pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// The ERROR reply for an invocation whose handler failed.
///
/// A [`WampError`] raised by the handler is passed through as-is. Any other error is reported
/// with its message as the only positional argument.
pub fn error_for_invocation(request: Id, error: &Error) -> Message {
    if let Some(error) = error.downcast_ref::<WampError>() {
        return Message::Error(ErrorMessage {
            request_type: Message::INVOCATION_TAG,
            request,
            details: error.details.clone(),
            error: error.error.clone(),
            arguments: error.arguments.clone(),
            arguments_keyword: error.arguments_keyword.clone(),
        });
    }
    Message::Error(ErrorMessage {
        request_type: Message::INVOCATION_TAG,
        request,
        details: message_details(error),
        error: Uri::for_error(error),
        arguments: List::from_iter([Value::String(error.to_string())]),
        arguments_keyword: Dictionary::default(),
    })
}
