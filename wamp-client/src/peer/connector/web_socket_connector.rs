use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::debug;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        ClientRequestBuilder,
        http::header::SEC_WEBSOCKET_PROTOCOL,
    },
};

use crate::{
    core::{
        stream::{
            MessageStream,
            TransportMessageStream,
        },
        types::HashMap,
    },
    peer::connector::connector::Connector,
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::web_socket_transport::WebSocketTransport,
};

/// A [`Connector`] for routers reachable over WebSocket.
///
/// Offers every configured serializer as a sub-protocol and uses the one the router picks.
pub struct WebSocketConnector {
    url: String,
    serializers: Vec<SerializerType>,
    headers: HashMap<String, String>,
    agent: String,
}

impl WebSocketConnector {
    pub fn new<S>(url: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            url: url.into(),
            serializers: Vec::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            headers: HashMap::default(),
            agent: String::default(),
        }
    }

    /// Sets the serializers offered to the router, in order of preference.
    pub fn with_serializers<I>(mut self, serializers: I) -> Self
    where
        I: IntoIterator<Item = SerializerType>,
    {
        self.serializers = serializers.into_iter().collect();
        self
    }

    /// Adds a header to the WebSocket handshake request.
    pub fn with_header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the User-Agent of the WebSocket handshake request.
    pub fn with_agent<S>(mut self, agent: S) -> Self
    where
        S: Into<String>,
    {
        self.agent = agent.into();
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn MessageStream>> {
        if self.serializers.is_empty() {
            return Err(Error::msg("no serializers configured"));
        }
        let mut request = ClientRequestBuilder::new(self.url.as_str().try_into()?);
        if !self.agent.is_empty() {
            request = request.with_header("User-Agent", &self.agent);
        }
        for serializer in &self.serializers {
            request = request.with_sub_protocol(serializer.protocol());
        }
        for (key, value) in &self.headers {
            request = request.with_header(key, value);
        }

        let (stream, response) = connect_async(request).await?;
        let serializer = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => SerializerType::try_from(protocol.to_str()?).map_err(Error::msg)?,
            None => return Err(Error::msg("handshake did not produce a sub-protocol")),
        };
        debug!("Connected to {} using {}", self.url, serializer.protocol());

        Ok(Box::new(TransportMessageStream::new(
            Box::new(WebSocketTransport::new(stream, serializer)),
            new_serializer(serializer),
        )))
    }
}
