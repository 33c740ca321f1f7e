use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Stream,
    StreamExt,
};
use log::debug;
use tokio::{
    sync::{
        broadcast,
        mpsc,
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::{
            ChannelTransmittableResult,
            WampError,
        },
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
            flag_set,
        },
        uri::Uri,
    },
    message::message::{
        CallMessage,
        Message,
    },
    peer::link::{
        Link,
        next_message,
    },
};

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// Additional options sent in CALL.
    pub options: Dictionary,
    /// Timeout for the router to enforce.
    ///
    /// The client does not time out calls on its own.
    pub timeout: Option<Duration>,
}

/// A result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
    /// More results follow this one.
    pub progress: bool,
}

/// A pending procedure call, which produces one or more results.
///
/// Dropping the pending call abandons it. Nothing is sent to the router, so the router still
/// considers the call outstanding.
#[derive(Debug)]
pub struct PendingRpc {
    request_id: Id,
    results_join_handle: JoinHandle<Result<()>>,
    result_rx: mpsc::Receiver<ChannelTransmittableResult<RpcResult>>,
    done: bool,
}

impl Drop for PendingRpc {
    fn drop(&mut self) {
        self.results_join_handle.abort();
    }
}

impl PendingRpc {
    /// The request ID of the call.
    pub fn request_id(&self) -> Id {
        self.request_id
    }

    /// Returns true if the call has received all of its results.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Waits for the next result of the procedure call.
    ///
    /// Returns `None` once the final result was read.
    pub async fn next_result(&mut self) -> Result<Option<RpcResult>> {
        if self.done {
            return Ok(None);
        }
        let result = match self.result_rx.recv().await {
            Some(result) => result.map_err(|err| err.into_error()),
            None => Err(Error::msg("procedure call finished with no result")),
        };
        self.done = result.as_ref().map_or(true, |result| !result.progress);
        result.map(Some)
    }

    /// Waits for the final result of the procedure call, skipping progressive results.
    pub async fn result(mut self) -> Result<RpcResult> {
        loop {
            match self.next_result().await? {
                Some(result) if !result.progress => return Ok(result),
                Some(_) => continue,
                None => return Err(Error::msg("procedure call finished with no result")),
            }
        }
    }

    /// Wraps the pending call as a stream of results.
    ///
    /// The stream is finished after the final result or error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RpcResult>> {
        futures_util::stream::unfold(self, move |mut rpc| async {
            match rpc.next_result().await {
                Ok(Some(result)) => Some((Ok(result), rpc)),
                Ok(None) => None,
                Err(err) => Some((Err(err), rpc)),
            }
        })
        .boxed()
    }
}

/// Calls a procedure.
///
/// Fails immediately if the CALL message could not be sent. Otherwise, results are correlated by
/// request ID in the background and read through the returned [`PendingRpc`].
pub async fn call(
    link: &Link,
    procedure: Uri,
    rpc_call: RpcCall,
    receive_progress: bool,
) -> Result<PendingRpc> {
    let request_id = link.generate_id().await;

    let mut options = rpc_call.options;
    if receive_progress {
        options.insert("receive_progress".to_owned(), Value::Bool(true));
    }
    if let Some(timeout) = rpc_call.timeout {
        options.insert(
            "timeout".to_owned(),
            Value::Integer(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        );
    }

    // Subscribe before sending, so that no reply can be missed.
    let message_rx = link.message_rx();
    link.send(Message::Call(CallMessage {
        request: request_id,
        options,
        procedure,
        arguments: rpc_call.arguments,
        arguments_keyword: rpc_call.arguments_keyword,
    }))
    .await?;

    let (result_tx, result_rx) = mpsc::channel(16);
    let results_join_handle = tokio::spawn(wait_for_results(request_id, message_rx, result_tx));
    Ok(PendingRpc {
        request_id,
        results_join_handle,
        result_rx,
        done: false,
    })
}

async fn wait_for_results(
    request_id: Id,
    mut message_rx: broadcast::Receiver<Message>,
    result_tx: mpsc::Sender<ChannelTransmittableResult<RpcResult>>,
) -> Result<()> {
    loop {
        let message = match next_message(&mut message_rx).await {
            Ok(message) => message,
            Err(err) => {
                result_tx.send(Err(err.into())).await?;
                break;
            }
        };
        match message {
            Message::Result(message) if message.call_request == request_id => {
                let progress = flag_set(&message.details, "progress");
                result_tx
                    .send(Ok(RpcResult {
                        arguments: message.yield_arguments,
                        arguments_keyword: message.yield_arguments_keyword,
                        details: message.details,
                        progress,
                    }))
                    .await?;
                if !progress {
                    break;
                }
            }
            Message::Error(message) if message.request == request_id => {
                debug!("Call {request_id} failed with {}", message.error);
                result_tx
                    .send(Err(Error::from(WampError::from(message)).into()))
                    .await?;
                break;
            }
            _ => (),
        }
    }
    Ok(())
}
