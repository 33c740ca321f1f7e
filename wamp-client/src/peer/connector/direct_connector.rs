use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::stream::{
        DirectMessageStream,
        MessageStream,
    },
    peer::connector::connector::Connector,
};

/// A [`Connector`] for routers running in the same process.
///
/// Every connection attempt calls the wrapped function for a new pair of channels.
pub struct DirectConnector {
    connect: Box<dyn Fn() -> Result<DirectMessageStream> + Send + Sync>,
}

impl DirectConnector {
    pub fn new<F>(connect: F) -> Self
    where
        F: Fn() -> Result<DirectMessageStream> + Send + Sync + 'static,
    {
        Self {
            connect: Box::new(connect),
        }
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self) -> Result<Box<dyn MessageStream>> {
        let stream = (self.connect)()?;
        Ok(Box::new(stream))
    }
}
