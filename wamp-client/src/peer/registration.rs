use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_util::{
    Stream,
    StreamExt,
    stream::{
        BoxStream,
        FuturesUnordered,
    },
};
use log::{
    debug,
    error,
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
            InvocationError,
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
    message::{
        common::error_for_invocation,
        message::{
            InvocationMessage,
            Message,
            RegisterMessage,
            UnregisterMessage,
            YieldMessage,
        },
    },
    peer::link::{
        Link,
        MessageSender,
        next_message,
    },
};

/// An invocation of a registered procedure.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request: Id,
    pub registration: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
    /// The raw INVOCATION message.
    pub message: InvocationMessage,
}

impl From<InvocationMessage> for Invocation {
    fn from(message: InvocationMessage) -> Self {
        Self {
            request: message.request,
            registration: message.registered_registration,
            arguments: message.call_arguments.clone(),
            arguments_keyword: message.call_arguments_keyword.clone(),
            details: message.details.clone(),
            message,
        }
    }
}

/// A single value yielded back to the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl RpcYield {
    /// A yield carrying a single positional value.
    pub fn from_value(value: Value) -> Self {
        Self {
            arguments: List::from_iter([value]),
            arguments_keyword: Dictionary::default(),
        }
    }
}

/// The output of a procedure handler.
pub enum ProcedureOutput {
    /// One result, sent as the final YIELD.
    Single(RpcYield),
    /// A sequence of results, each sent as a progressive result, then an empty final result.
    Progressive(BoxStream<'static, Result<RpcYield>>),
}

impl ProcedureOutput {
    /// Output over a stream of values, each sent as a progressive YIELD as soon as it is produced.
    ///
    /// An empty final YIELD ends the call once the stream is exhausted.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::Progressive(
            stream
                .map(|value| value.map(RpcYield::from_value))
                .boxed(),
        )
    }
}

impl From<Value> for ProcedureOutput {
    fn from(value: Value) -> Self {
        Self::Single(RpcYield::from_value(value))
    }
}

impl From<RpcYield> for ProcedureOutput {
    fn from(value: RpcYield) -> Self {
        Self::Single(value)
    }
}

/// A procedure handler that only looks at positional arguments.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn invoke(&self, arguments: List) -> Result<ProcedureOutput>;
}

/// A procedure handler that receives the entire invocation.
#[async_trait]
pub trait ExtendedProcedure: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<ProcedureOutput>;
}

/// Adapts a [`Procedure`] to an [`ExtendedProcedure`].
pub struct BasicProcedure<P>(pub P);

#[async_trait]
impl<P> ExtendedProcedure for BasicProcedure<P>
where
    P: Procedure,
{
    async fn invoke(&self, invocation: Invocation) -> Result<ProcedureOutput> {
        self.0.invoke(invocation.arguments).await
    }
}

/// A [`Procedure`] backed by an async function.
pub struct ProcedureFn<F>(F);

#[async_trait]
impl<F, Fut> Procedure for ProcedureFn<F>
where
    F: Fn(List) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcedureOutput>> + Send + 'static,
{
    async fn invoke(&self, arguments: List) -> Result<ProcedureOutput> {
        (self.0)(arguments).await
    }
}

/// Creates a [`Procedure`] from an async function.
pub fn procedure_fn<F, Fut>(f: F) -> ProcedureFn<F>
where
    F: Fn(List) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcedureOutput>> + Send + 'static,
{
    ProcedureFn(f)
}

/// An [`ExtendedProcedure`] backed by an async function.
pub struct ExtendedProcedureFn<F>(F);

#[async_trait]
impl<F, Fut> ExtendedProcedure for ExtendedProcedureFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcedureOutput>> + Send + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<ProcedureOutput> {
        (self.0)(invocation).await
    }
}

/// Creates an [`ExtendedProcedure`] from an async function.
pub fn extended_procedure_fn<F, Fut>(f: F) -> ExtendedProcedureFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcedureOutput>> + Send + 'static,
{
    ExtendedProcedureFn(f)
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone)]
pub struct ProcedureOptions {
    /// How the procedure should be matched for procedure calls.
    pub match_style: MatchStyle,
    /// The caller's identity should be disclosed.
    pub disclose_caller: bool,
    /// Additional options sent in REGISTER.
    pub options: Dictionary,
}

impl ProcedureOptions {
    fn into_dictionary(self) -> Dictionary {
        let mut options = self.options;
        if let Some(match_style) = self.match_style.option_value() {
            options.insert("match".to_owned(), Value::String(match_style.to_owned()));
        }
        if self.disclose_caller {
            options.insert("disclose_caller".to_owned(), Value::Bool(true));
        }
        options
    }
}

/// A lifecycle event of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    Registered(Id),
    Unregistered,
}

/// The outcome of handling a single invocation.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub request: Id,
    pub result: ChannelTransmittableResult<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationState {
    Registering,
    Registered {
        registration: Id,
    },
    Unregistering {
        registration: Id,
        unregister_request: Id,
    },
    Unregistered,
    Errored,
}

impl RegistrationState {
    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Registering, Self::Registered { .. }) => true,
            (Self::Registering, Self::Unregistered) => true,
            (Self::Registering, Self::Errored) => true,
            (Self::Registered { .. }, Self::Unregistering { .. }) => true,
            (Self::Registered { .. }, Self::Unregistered) => true,
            (Self::Registered { .. }, Self::Errored) => true,
            (Self::Unregistering { .. }, Self::Unregistered) => true,
            (Self::Unregistering { .. }, Self::Errored) => true,
            _ => false,
        }
    }

    /// The registration ID invocations are correlated to.
    fn registration(&self) -> Option<Id> {
        match self {
            Self::Registered { registration } => Some(*registration),
            Self::Unregistering { registration, .. } => Some(*registration),
            _ => None,
        }
    }
}

/// A procedure registration.
///
/// Dropping the registration unregisters the procedure in the background.
pub struct Registration {
    request_id: Id,
    id: Option<Id>,
    event_rx: mpsc::UnboundedReceiver<ChannelTransmittableResult<RegistrationEvent>>,
    invocation_report_tx: broadcast::Sender<InvocationReport>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Registration {
    /// The request ID of the REGISTER message.
    pub fn request_id(&self) -> Id {
        self.request_id
    }

    /// The registration ID, once the router confirmed the registration.
    pub fn id(&self) -> Option<Id> {
        self.id
    }

    /// Waits until the router confirms the registration.
    pub async fn registered(&mut self) -> Result<Id> {
        if let Some(id) = self.id {
            return Ok(id);
        }
        match self.next_event().await? {
            Some(RegistrationEvent::Registered(id)) => Ok(id),
            _ => Err(Error::msg("registration ended before it was registered")),
        }
    }

    /// Waits for the next lifecycle event.
    ///
    /// Returns `None` once the registration completed normally. A registration error or a failed
    /// invocation ends the registration with an error.
    pub async fn next_event(&mut self) -> Result<Option<RegistrationEvent>> {
        match self.event_rx.recv().await {
            Some(Ok(event)) => {
                if let RegistrationEvent::Registered(id) = event {
                    self.id = Some(id);
                }
                Ok(Some(event))
            }
            Some(Err(err)) => Err(err.into_error()),
            None => Ok(None),
        }
    }

    /// A receiver for the outcome of every invocation handled from now on.
    pub fn invocation_report_rx(&self) -> broadcast::Receiver<InvocationReport> {
        self.invocation_report_tx.subscribe()
    }

    /// Unregisters the procedure and waits for the registration to complete.
    ///
    /// A registration that was never confirmed is abandoned without sending anything.
    pub async fn unregister(mut self) -> Result<()> {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            cancel_tx.send(()).ok();
        }
        while self.next_event().await?.is_some() {}
        Ok(())
    }
}

/// Registers a procedure.
///
/// Fails immediately if the REGISTER message could not be sent. Otherwise, the registration runs
/// in the background until it is unregistered or fails.
pub async fn register(
    link: &Link,
    procedure: Uri,
    handler: Arc<dyn ExtendedProcedure>,
    options: ProcedureOptions,
) -> Result<Registration> {
    let request_id = link.generate_id().await;
    let message_rx = link.message_rx();
    link.send(Message::Register(RegisterMessage {
        request: request_id,
        options: options.into_dictionary(),
        procedure: procedure.clone(),
    }))
    .await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (invocation_report_tx, _) = broadcast::channel(16);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let task = RegistrationTask {
        link: link.clone(),
        procedure,
        request_id,
        handler,
        event_tx,
        invocation_report_tx: invocation_report_tx.clone(),
        state: RegistrationState::Registering,
    };
    tokio::spawn(task.run(message_rx, cancel_rx));

    Ok(Registration {
        request_id,
        id: None,
        event_rx,
        invocation_report_tx,
        cancel_tx: Some(cancel_tx),
    })
}

type InvocationFuture = Pin<Box<dyn Future<Output = (Id, Result<()>)> + Send>>;

struct RegistrationTask {
    link: Link,
    procedure: Uri,
    request_id: Id,
    handler: Arc<dyn ExtendedProcedure>,
    event_tx: mpsc::UnboundedSender<ChannelTransmittableResult<RegistrationEvent>>,
    invocation_report_tx: broadcast::Sender<InvocationReport>,
    state: RegistrationState,
}

impl RegistrationTask {
    async fn run(
        mut self,
        mut message_rx: broadcast::Receiver<Message>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let result = self.registration_loop(&mut message_rx, cancel_rx).await;
        if let Err(err) = result {
            error!("Registration of {} failed: {err:#}", self.procedure);
            // The registration is over, so the router should stop routing invocations here.
            if let RegistrationState::Registered { registration } = self.state {
                if let Err(err) = self.unregister(registration).await {
                    debug!(
                        "Failed to unregister {} after failure: {err:#}",
                        self.procedure
                    );
                }
            }
            self.transition(RegistrationState::Errored);
            self.event_tx.send(Err(err.into())).ok();
        }
    }

    fn transition(&mut self, next: RegistrationState) {
        if self.state.allowed_state_transition(&next) {
            debug!(
                "Registration of {} transitioned from {:?} to {next:?}",
                self.procedure, self.state
            );
            self.state = next;
        }
    }

    /// Sends UNREGISTER for the registration.
    ///
    /// The state moves to unregistering before sending, so a failed send is never retried.
    async fn unregister(&mut self, registration: Id) -> Result<()> {
        let unregister_request = self.link.generate_id().await;
        self.transition(RegistrationState::Unregistering {
            registration,
            unregister_request,
        });
        self.link
            .send(Message::Unregister(UnregisterMessage {
                request: unregister_request,
                registered_registration: registration,
            }))
            .await
    }

    /// Checks if an UNREGISTERED message ends the registration.
    ///
    /// The router may reference the original REGISTER request or our own UNREGISTER request.
    fn acknowledges_unregister(&self, request: Id) -> bool {
        match self.state {
            RegistrationState::Registered { .. } => request == self.request_id,
            RegistrationState::Unregistering {
                unregister_request, ..
            } => request == self.request_id || request == unregister_request,
            _ => false,
        }
    }

    /// Handles cancellation. Returns true if the registration is over.
    async fn cancel(&mut self) -> Result<bool> {
        match self.state {
            RegistrationState::Registered { registration } => {
                self.unregister(registration).await?;
                Ok(false)
            }
            RegistrationState::Unregistering { .. } => Ok(false),
            _ => {
                // Nothing is owed to the router without a registration ID.
                self.transition(RegistrationState::Unregistered);
                Ok(true)
            }
        }
    }

    /// Handles a message. Returns true if the registration is over.
    fn handle_message(
        &mut self,
        message: Message,
        invocations: &mut FuturesUnordered<InvocationFuture>,
    ) -> Result<bool> {
        match (self.state, message) {
            (RegistrationState::Registering, Message::Registered(message))
                if message.register_request == self.request_id =>
            {
                self.transition(RegistrationState::Registered {
                    registration: message.registration,
                });
                self.event_tx
                    .send(Ok(RegistrationEvent::Registered(message.registration)))
                    .ok();
            }
            (RegistrationState::Registering, Message::Error(message))
                if message.request == self.request_id =>
            {
                return Err(WampError::from(message).into());
            }
            (RegistrationState::Unregistering { unregister_request, .. }, Message::Error(message))
                if message.request == unregister_request =>
            {
                return Err(Error::from(WampError::from(message))
                    .context(format!("failed to unregister {}", self.procedure)));
            }
            (state, Message::Invocation(message))
                if state.registration() == Some(message.registered_registration) =>
            {
                invocations.push(Box::pin(invoke(
                    self.handler.clone(),
                    self.link.sender(),
                    message.into(),
                )));
            }
            (_, Message::Unregistered(message))
                if self.acknowledges_unregister(message.unregister_request) =>
            {
                self.transition(RegistrationState::Unregistered);
                self.event_tx.send(Ok(RegistrationEvent::Unregistered)).ok();
                return Ok(true);
            }
            _ => (),
        }
        Ok(false)
    }

    async fn registration_loop(
        &mut self,
        message_rx: &mut broadcast::Receiver<Message>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut invocations = FuturesUnordered::<InvocationFuture>::new();
        let mut canceled = false;
        loop {
            tokio::select! {
                message = next_message(message_rx) => {
                    if self.handle_message(message?, &mut invocations)? {
                        return Ok(());
                    }
                }
                // Dropping the handle counts as cancellation.
                _ = &mut cancel_rx, if !canceled => {
                    canceled = true;
                    if self.cancel().await? {
                        return Ok(());
                    }
                }
                Some((request, result)) = invocations.next(), if !invocations.is_empty() => {
                    match result {
                        Ok(()) => {
                            self.invocation_report_tx.send(InvocationReport { request, result: Ok(()) }).ok();
                        }
                        Err(err) => {
                            warn!("Invocation {request} of {} failed: {err:#}", self.procedure);
                            self.invocation_report_tx.send(InvocationReport { request, result: Err((&err).into()) }).ok();
                            return Err(InvocationError {
                                request,
                                error: Uri::for_error(&err),
                                message: format!("{err:#}"),
                            }.into());
                        }
                    }
                }
            }
        }
    }
}

fn yield_message(request: Id, rpc_yield: RpcYield, progress: bool) -> Message {
    let mut options = Dictionary::default();
    if progress {
        options.insert("progress".to_owned(), Value::Bool(true));
    }
    Message::Yield(YieldMessage {
        invocation_request: request,
        options,
        arguments: rpc_yield.arguments,
        arguments_keyword: rpc_yield.arguments_keyword,
    })
}

async fn invoke(
    handler: Arc<dyn ExtendedProcedure>,
    sender: Arc<dyn MessageSender>,
    invocation: Invocation,
) -> (Id, Result<()>) {
    let request = invocation.request;
    let result = match invoke_and_yield(handler.as_ref(), sender.as_ref(), invocation).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // No further YIELD is sent for this invocation.
            if let Err(send_err) = sender.send(error_for_invocation(request, &err)).await {
                warn!("Failed to send error for invocation {request}: {send_err:#}");
            }
            Err(err)
        }
    };
    (request, result)
}

async fn invoke_and_yield(
    handler: &dyn ExtendedProcedure,
    sender: &dyn MessageSender,
    invocation: Invocation,
) -> Result<()> {
    let request = invocation.request;
    match handler.invoke(invocation).await? {
        ProcedureOutput::Single(rpc_yield) => {
            sender.send(yield_message(request, rpc_yield, false)).await
        }
        ProcedureOutput::Progressive(mut stream) => {
            while let Some(rpc_yield) = stream.next().await {
                sender.send(yield_message(request, rpc_yield?, true)).await?;
            }
            sender
                .send(yield_message(request, RpcYield::default(), false))
                .await
        }
    }
}

#[cfg(test)]
mod registration_test {
    use crate::{
        core::{
            id::Id,
            match_style::MatchStyle,
            types::{
                Dictionary,
                Value,
            },
        },
        peer::registration::{
            ProcedureOptions,
            RegistrationState,
        },
    };

    #[test]
    fn builds_register_options() {
        let options = ProcedureOptions {
            match_style: MatchStyle::Prefix,
            disclose_caller: true,
            options: Dictionary::from_iter([("invoke".to_owned(), Value::String("roundrobin".to_owned()))]),
        }
        .into_dictionary();
        assert_eq!(options.get("match"), Some(&Value::String("prefix".to_owned())));
        assert_eq!(options.get("disclose_caller"), Some(&Value::Bool(true)));
        assert_eq!(options.get("invoke"), Some(&Value::String("roundrobin".to_owned())));
        assert!(ProcedureOptions::default().into_dictionary().is_empty());
    }

    #[test]
    fn unregistered_and_errored_are_terminal() {
        let registration = Id::try_from(5).unwrap();
        let registered = RegistrationState::Registered { registration };
        assert!(RegistrationState::Registering.allowed_state_transition(&registered));
        assert!(registered.allowed_state_transition(&RegistrationState::Unregistering {
            registration,
            unregister_request: Id::try_from(6).unwrap(),
        }));
        assert!(!RegistrationState::Unregistered.allowed_state_transition(&registered));
        assert!(!RegistrationState::Errored.allowed_state_transition(&RegistrationState::Unregistered));
        assert!(!RegistrationState::Registering.allowed_state_transition(&RegistrationState::Unregistering {
            registration,
            unregister_request: Id::try_from(6).unwrap(),
        }));
    }
}
