use anyhow::Result;
use async_trait::async_trait;

use crate::core::stream::MessageStream;

/// A type for initiating a connection to a router.
///
/// Called once for every connection attempt, including reconnects.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MessageStream>>;
}
