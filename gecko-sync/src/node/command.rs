use std::sync::Arc;

use async_trait::async_trait;

use crate::network::Packet;

use super::{Error, Node, NodeId};

/// 命令处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Handled,
    /// 暂时无法处理，稍后重新派发
    Reschedule,
}

/// 报文处理器
///
/// 节点自定义命令，会话中的分布式对象和用户报文都通过此接口派发。
/// 处理器在接收任务中执行，不能阻塞等待其他报文。
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, node: &Arc<Node>, packet: &Packet) -> Result<CommandResult, Error>;

    /// 节点断开连接
    async fn node_disconnected(&self, _node: NodeId) {}
}
