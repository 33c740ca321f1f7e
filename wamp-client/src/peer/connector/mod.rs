mod connector;
mod direct_connector;
mod web_socket_connector;

pub use connector::Connector;
pub use direct_connector::DirectConnector;
pub use web_socket_connector::WebSocketConnector;
