use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

use log::{info, warn};

use crate::{
    lock,
    network::Protocol,
    node::{local::NodeCore, LocalNode, Node, NodeId},
};

use super::Error;

/// 网络中节点的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkNodeState {
    Stopped,
    Initialized,
    Launched,
    Running,
}

/// 使用同一种传输协议的一组节点
///
/// 只有 Initialized 的节点才能被启动，Running 的节点一定有可用的连接
pub struct Network {
    protocol: Protocol,
    local: Weak<NodeCore>,
    nodes: Mutex<BTreeMap<NodeId, (Arc<Node>, NetworkNodeState)>>,
}

impl Network {
    pub(crate) fn new(protocol: Protocol, local: Weak<NodeCore>) -> Self {
        Self {
            protocol,
            local,
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn local_node(&self) -> Result<LocalNode, Error> {
        LocalNode::upgrade(&self.local).ok_or(Error::LocalNodeStopped)
    }

    /// 加入节点，节点必须有本网络协议的连接描述
    pub fn add_node(&self, node: Arc<Node>) -> Result<(), Error> {
        let matched = node
            .descriptions()
            .iter()
            .any(|desc| desc.protocol == self.protocol);
        if !matched {
            return Err(Error::ProtocolMismatch {
                node: node.id(),
                protocol: self.protocol,
            });
        }
        lock(&self.nodes).insert(node.id(), (node, NetworkNodeState::Stopped));
        Ok(())
    }

    pub fn remove_node(&self, id: NodeId) -> Option<Arc<Node>> {
        lock(&self.nodes).remove(&id).map(|(node, _)| node)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.nodes).values().map(|(node, _)| node.clone()).collect()
    }

    /// 节点状态，连接断开的 Running 节点回到 Initialized
    pub fn node_state(&self, id: NodeId) -> Option<NetworkNodeState> {
        let mut nodes = lock(&self.nodes);
        let (node, state) = nodes.get_mut(&id)?;
        if *state == NetworkNodeState::Running && !node.is_connected() {
            *state = NetworkNodeState::Initialized;
        }
        Some(*state)
    }

    fn set_node_state(&self, id: NodeId, state: NetworkNodeState) {
        if let Some(entry) = lock(&self.nodes).get_mut(&id) {
            entry.1 = state;
        }
    }

    /// 所有 Stopped 的节点进入 Initialized
    pub fn init(&self) {
        for (_, state) in lock(&self.nodes).values_mut() {
            if *state == NetworkNodeState::Stopped {
                *state = NetworkNodeState::Initialized;
            }
        }
    }

    fn initialized_nodes(&self) -> Vec<Arc<Node>> {
        let ids: Vec<NodeId> = lock(&self.nodes).keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.node_state(*id) == Some(NetworkNodeState::Initialized))
            .filter_map(|id| lock(&self.nodes).get(&id).map(|(node, _)| node.clone()))
            .collect()
    }

    /// 启动所有 Initialized 的节点
    ///
    /// 先发起所有连接或远程启动，再等待被启动的节点回连。
    /// 任何一个节点失败都会使整个调用失败，已经启动的节点保持运行。
    pub async fn start(&self) -> Result<(), Error> {
        let local = self.local_node()?;
        let nodes = self.initialized_nodes();

        let mut launched = Vec::new();
        for node in &nodes {
            match local.init_connect(node).await {
                Ok(None) => self.set_node_state(node.id(), NetworkNodeState::Running),
                Ok(Some(launch)) => {
                    self.set_node_state(node.id(), NetworkNodeState::Launched);
                    launched.push((node.clone(), launch));
                }
                Err(e) => {
                    warn!("start {} failed: {}", node.id(), e);
                    return Err(Error::NodeStartFailed {
                        node: node.id(),
                        source: e,
                    });
                }
            }
        }

        for (node, launch) in launched {
            if let Err(e) = local.sync_connect(&node, launch).await {
                self.set_node_state(node.id(), NetworkNodeState::Initialized);
                return Err(Error::NodeStartFailed {
                    node: node.id(),
                    source: e,
                });
            }
            self.set_node_state(node.id(), NetworkNodeState::Running);
        }
        info!("{:?} network started {} nodes", self.protocol, nodes.len());
        Ok(())
    }

    /// 启动单个节点
    pub async fn start_node(&self, id: NodeId) -> Result<(), Error> {
        let node = lock(&self.nodes)
            .get(&id)
            .map(|(node, _)| node.clone())
            .ok_or(Error::UnknownNode(id))?;
        match self.node_state(id) {
            Some(NetworkNodeState::Initialized) => {}
            Some(state) => return Err(Error::InvalidNodeState { node: id, state }),
            None => return Err(Error::UnknownNode(id)),
        }

        let local = self.local_node()?;
        let res = match local.init_connect(&node).await {
            Ok(None) => Ok(()),
            Ok(Some(launch)) => {
                self.set_node_state(id, NetworkNodeState::Launched);
                local.sync_connect(&node, launch).await
            }
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => {
                self.set_node_state(id, NetworkNodeState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_node_state(id, NetworkNodeState::Initialized);
                Err(Error::NodeStartFailed { node: id, source: e })
            }
        }
    }

    /// 断开所有 Running 的节点，回到 Initialized
    pub async fn stop(&self) {
        let ids: Vec<NodeId> = lock(&self.nodes).keys().copied().collect();
        for id in ids {
            self.stop_node(id).await;
        }
    }

    pub async fn stop_node(&self, id: NodeId) {
        let node = match lock(&self.nodes).get(&id) {
            Some((node, NetworkNodeState::Running)) => node.clone(),
            _ => return,
        };
        if let Ok(local) = self.local_node() {
            if let Err(e) = local.disconnect(&node).await {
                warn!("stop {}: {}", id, e);
            }
        }
        self.set_node_state(id, NetworkNodeState::Initialized);
    }

    /// 停止所有节点并回到 Stopped
    pub async fn exit(&self) {
        self.stop().await;
        for (_, state) in lock(&self.nodes).values_mut() {
            *state = NetworkNodeState::Stopped;
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("protocol", &self.protocol)
            .field("nodes", &lock(&self.nodes).len())
            .finish()
    }
}
