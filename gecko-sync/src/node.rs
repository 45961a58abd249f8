//! 节点层
//! 本地节点拥有接收任务和连接集合，负责把收到的报文派发给节点命令或会话

use std::{fmt, io};

pub use command::{CommandResult, Dispatch};
pub use local::LocalNode;
pub use remote::Node;

use crate::{network, network::packet, request};

pub mod command;
mod launch;
pub mod local;
mod receiver;
pub mod remote;

/// 节点 id，只在进程内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    /// 已启动远程进程，等待回连
    Launched,
    Connected,
    /// 本地节点的接收任务正在运行
    Listening,
}

/// 注册到请求处理器上的请求，记录目标节点以便断开时取消
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub(crate) node: NodeId,
    pub(crate) kind: RequestKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Launch,
    MapSession,
    GenIds,
    Subscribe,
    Barrier,
}

/// 请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Done,
    Value(u32),
    Subscribed { version: u32 },
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] network::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Request error: {0}")]
    Request(#[from] request::Error),
    #[error("Operation not allowed in node state {0:?}")]
    InvalidState(NodeState),
    #[error("{0} is not connected")]
    NotConnected(NodeId),
    #[error("Could not connect {0}")]
    ConnectFailed(NodeId),
    #[error("Could not launch {node}: {reason}")]
    LaunchFailed { node: NodeId, reason: String },
    #[error("{0} did not connect back within launch timeout")]
    LaunchTimeout(NodeId),
    #[error("Invalid client argument: {0}")]
    InvalidClientArg(String),
    #[error("First packet is not a connect packet")]
    Handshake,
    #[error("Unknown launch request: {0}")]
    UnknownLaunch(u64),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("No handler for datatype {datatype} command {command}")]
    UnknownCommand { datatype: u32, command: u32 },
    #[error("Command datatype {datatype} command {command} is reserved")]
    ReservedCommand { datatype: u32, command: u32 },
    #[error("Too many rescheduled packets ({0})")]
    PendingOverflow(usize),
    #[error("Connection set error: {0}")]
    Select(io::Error),
    #[error("Receiver task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
