use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::{
    lock,
    network::{packet::node::NodeMessagePacket, Connection, ConnectionDescription, Packet},
    MessageType,
};

use super::{Error, NodeId, NodeState};

/// 节点代理
///
/// 本地节点也有一个代理，通过回环管道向自己发送报文
pub struct Node {
    id: NodeId,
    state: Mutex<NodeState>,
    connection: Mutex<Option<Arc<Connection>>>,
    descriptions: Mutex<Vec<ConnectionDescription>>,
    auto_launch: AtomicBool,
}

impl Node {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            state: Mutex::new(NodeState::Stopped),
            connection: Mutex::new(None),
            descriptions: Mutex::new(Vec::new()),
            auto_launch: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        *lock(&self.state) = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
            && lock(&self.connection)
                .as_ref()
                .map(|conn| conn.is_connected())
                .unwrap_or(false)
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).clone()
    }

    pub(crate) fn set_connection(&self, conn: Arc<Connection>) {
        *lock(&self.connection) = Some(conn);
    }

    pub(crate) fn take_connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).take()
    }

    /// 连接此节点时依次尝试的描述
    pub fn add_description(&self, description: ConnectionDescription) {
        lock(&self.descriptions).push(description);
    }

    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        lock(&self.descriptions).clone()
    }

    /// 所有描述都无法直接连接时，是否使用启动命令远程启动节点
    pub fn set_auto_launch(&self, auto_launch: bool) {
        self.auto_launch.store(auto_launch, Ordering::Relaxed);
    }

    pub fn auto_launch(&self) -> bool {
        self.auto_launch.load(Ordering::Relaxed)
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), Error> {
        let conn = self.connection().ok_or(Error::NotConnected(self.id))?;
        if !conn.is_connected() {
            return Err(Error::NotConnected(self.id));
        }
        conn.send_packet(packet).await?;
        Ok(())
    }

    /// 发送节点消息，对端通过 Hook::message 收到
    pub async fn send_message(&self, kind: MessageType, data: &[u8]) -> Result<(), Error> {
        self.send(&NodeMessagePacket::new(kind, data).to_packet())
            .await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
