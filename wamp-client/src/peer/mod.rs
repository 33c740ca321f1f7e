mod call;
mod challenge;
mod client;
mod connector;
mod link;
mod registration;
mod session;
mod subscription;
mod supervisor;

pub use call::{
    PendingRpc,
    RpcCall,
    RpcResult,
    call,
};
pub use challenge::{
    ChallengeHandler,
    ChallengeResponder,
};
pub use client::{
    Client,
    ClientBuilder,
    ClientConfig,
};
pub use connector::{
    Connector,
    DirectConnector,
    WebSocketConnector,
};
pub use link::{
    Link,
    MessageSender,
    next_message,
};
pub use registration::{
    BasicProcedure,
    ExtendedProcedure,
    ExtendedProcedureFn,
    Invocation,
    InvocationReport,
    Procedure,
    ProcedureFn,
    ProcedureOptions,
    ProcedureOutput,
    Registration,
    RegistrationEvent,
    RpcYield,
    extended_procedure_fn,
    procedure_fn,
    register,
};
pub use session::{
    ActiveSession,
    EstablishedSession,
    SessionState,
    establish_session,
    hello_details,
};
pub use subscription::{
    ReceivedEvent,
    Subscription,
    SubscriptionOptions,
    subscribe,
};
pub use supervisor::ReconnectConfig;
