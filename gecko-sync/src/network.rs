//! 网络层
//! 本层只关心连接的建立和字节读写，不包含任何协议相关逻辑

use std::io;

pub use conn::{Connection, Readiness, State};
pub use conn_set::{ConnectionSet, Event};
pub use description::{ConnectionDescription, Protocol, DEFAULT_PORT};
pub use packet::Packet;

pub mod conn;
pub mod conn_set;
pub mod description;
pub mod packet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid connection address: {0}")]
    InvalidAddress(String),
    #[error("Operation not allowed in connection state {0:?}")]
    InvalidState(State),
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("Short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
}

impl Error {
    /// 对端已断开，而不是协议错误
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ShortRead { .. } | Error::ShortWrite { .. }
        )
    }
}
