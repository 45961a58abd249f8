//! 一个分布式版本化对象同步库
//!
//! 多个进程（节点）通过主从复制共享可变状态：主对象提交增量并广播，
//! 从对象按照自己的节奏同步到指定版本。

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

pub use config::Config;
pub use context::Context;
pub use error::Error;
pub use network::packet::node::MessageType;
pub use node::{LocalNode, Node, NodeId};
pub use object::{Distributed, MasterObject, SlaveObject, Version};
pub use session::Session;

pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod network;
pub mod node;
pub mod object;
pub mod request;
pub mod session;

/// 节点事件发生时的回调，由用户实现
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    /// 对端节点连接成功
    async fn connected(&self, node: NodeId);
    /// 对端节点连接断开
    async fn disconnected(&self, node: NodeId);
    /// 收到节点消息
    async fn message(&self, node: NodeId, kind: MessageType, data: &[u8]);
}

pub struct HookNoop;

#[async_trait]
impl Hook for HookNoop {
    async fn connected(&self, _node: NodeId) {}
    async fn disconnected(&self, _node: NodeId) {}
    async fn message(&self, _node: NodeId, _kind: MessageType, _data: &[u8]) {}
}

/// 锁被污染时继续使用内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
