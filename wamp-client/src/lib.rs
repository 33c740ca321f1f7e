//! # wamp-client
//!
//! **wamp-client** is an asynchronous client for the **Web Application Messaging Protocol**
//! (WAMP). A single client acts as a caller, a callee, and a subscriber at the same time, with
//! every operation multiplexed over one connection to a router.
//!
//! Every call, registration, and subscription runs as its own task that watches the shared stream
//! of inbound messages for the messages correlated with it. Dropping the handle of an operation
//! cancels it: registrations and subscriptions are removed from the router, while calls are simply
//! abandoned.
//!
//! The connection is supervised in the background. When it drops, the client reconnects and
//! re-establishes its session. Operations started on the old connection fail with
//! [`PeerNotConnectedError`][`crate::core::error::PeerNotConnectedError`] and must be restarted by
//! their owner.
//!
//! ## Example
//!
//! ```no_run
//! use wamp_client::{
//!     core::{
//!         types::{
//!             List,
//!             Value,
//!         },
//!         uri::Uri,
//!     },
//!     peer::{
//!         ClientBuilder,
//!         ProcedureOptions,
//!         ProcedureOutput,
//!         RpcCall,
//!         WebSocketConnector,
//!         procedure_fn,
//!     },
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (client, _join_handle) = ClientBuilder::new(Uri::try_from("realm1")?)
//!         .start(WebSocketConnector::new("ws://127.0.0.1:9090"));
//!
//!     let mut registration = client
//!         .register(
//!             Uri::try_from("com.myapp.example")?,
//!             procedure_fn(|_arguments: List| async move { Ok(ProcedureOutput::from(Value::Integer(1234567))) }),
//!             ProcedureOptions::default(),
//!         )
//!         .await?;
//!     registration.registered().await?;
//!
//!     let result = client
//!         .call_and_wait(
//!             Uri::try_from("com.myapp.example")?,
//!             RpcCall {
//!                 arguments: List::from_iter([Value::Integer(123)]),
//!                 ..Default::default()
//!             },
//!         )
//!         .await?;
//!     println!("Call result: {:?}", result.arguments);
//!
//!     registration.unregister().await?;
//!     client.close().await
//! }
//! ```

pub mod auth;
pub mod core;
pub mod message;
pub mod peer;
pub mod serializer;
pub mod transport;
