use crate::{config, network, node, object, request, session};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("Network error: {0}")]
    Network(#[from] network::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] network::packet::Error),
    #[error("Request error: {0}")]
    Request(#[from] request::Error),
    #[error("Node error: {0}")]
    Node(#[from] node::Error),
    #[error("Session error: {0}")]
    Session(#[from] session::Error),
    #[error("Object error: {0}")]
    Object(#[from] object::Error),
}
