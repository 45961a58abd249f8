//! 会话层
//!
//! 会话把一组节点组织成一个分布式应用实例，负责分配对象 id，
//! 并把对象和用户报文派发给注册在会话中的处理器。
//! 主会话所在的节点负责分配 id，其他节点通过请求向主会话申请。

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
};

use log::{debug, info, warn};

use crate::{
    lock,
    network::{
        packet::{
            self,
            object::{
                object_id, BarrierPacket, ObjectSubscribeReplyPacket, ObjectSubscribePacket,
                CMD_BARRIER_ENTER_REPLY, CMD_OBJECT_SUBSCRIBE, CMD_OBJECT_SUBSCRIBE_REPLY,
            },
            session::{
                SessionGenIdsPacket, SessionGenIdsReplyPacket, UserPacket, CMD_SESSION_GEN_IDS,
                CMD_SESSION_GEN_IDS_REPLY,
            },
            DATATYPE_MOBJECT, DATATYPE_OBJECT, DATATYPE_SESSION, DATATYPE_USER, INVALID_ID,
        },
        Packet, Protocol,
    },
    node::{
        self, local::NodeCore, CommandResult, Dispatch, LocalNode, Node, NodeId, NodeState,
        PendingRequest, Reply, RequestKind,
    },
    object::{self, Distributed, MasterObject, SlaveObject},
    request,
};

pub use barrier::Barrier;
pub use network::{Network, NetworkNodeState};

pub mod barrier;
pub mod network;

/// id 0 保留
const FIRST_ID: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Node error: {0}")]
    Node(#[from] node::Error),
    #[error("Request error: {0}")]
    Request(#[from] request::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("Local node stopped")]
    LocalNodeStopped,
    #[error("Invalid id range: {0}")]
    InvalidRange(u32),
    #[error("Session ids exhausted")]
    IdsExhausted,
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("{node} has no {protocol:?} connection description")]
    ProtocolMismatch { node: NodeId, protocol: Protocol },
    #[error("{node} is {state:?}")]
    InvalidNodeState {
        node: NodeId,
        state: NetworkNodeState,
    },
    #[error("Failed to start {node}: {source}")]
    NodeStartFailed {
        node: NodeId,
        #[source]
        source: node::Error,
    },
    #[error("Barrier {0} was not released")]
    BarrierFailed(u32),
}

pub struct Session {
    id: u32,
    name: String,
    /// 主会话所在的节点，本地为主会话时是本地节点自身的代理
    server: Arc<Node>,
    is_master: bool,
    local: Weak<NodeCore>,
    next_id: Mutex<u32>,
    objects: Mutex<HashMap<u32, Arc<dyn Dispatch>>>,
    /// 已注销的对象，迟到的报文直接丢弃
    detached: Mutex<HashSet<u32>>,
    users: Mutex<HashMap<u32, Arc<dyn Dispatch>>>,
    networks: Mutex<Vec<Arc<Network>>>,
}

impl Session {
    pub(crate) fn new(
        id: u32,
        name: &str,
        server: Arc<Node>,
        is_master: bool,
        local: Weak<NodeCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            server,
            is_master,
            local,
            next_id: Mutex::new(FIRST_ID),
            objects: Mutex::new(HashMap::new()),
            detached: Mutex::new(HashSet::new()),
            users: Mutex::new(HashMap::new()),
            networks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Arc<Node> {
        &self.server
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub(crate) fn local_node(&self) -> Result<LocalNode, Error> {
        LocalNode::upgrade(&self.local).ok_or(Error::LocalNodeStopped)
    }

    fn alloc_ids(&self, range: u32) -> Result<u32, Error> {
        let mut next = lock(&self.next_id);
        let end = next
            .checked_add(range)
            .filter(|end| *end <= INVALID_ID)
            .ok_or(Error::IdsExhausted)?;
        let first = *next;
        *next = end;
        Ok(first)
    }

    /// 分配 range 个连续 id，返回第一个
    pub async fn gen_ids(&self, range: u32) -> Result<u32, Error> {
        if range == 0 {
            return Err(Error::InvalidRange(range));
        }
        if self.is_master {
            return self.alloc_ids(range);
        }

        let local = self.local_node()?;
        let requests = &local.core().requests;
        let request_id = requests.register_request(PendingRequest {
            node: self.server.id(),
            kind: RequestKind::GenIds,
        });
        let packet = SessionGenIdsPacket {
            session_id: self.id,
            request_id,
            range,
        };
        if let Err(e) = self.server.send(&packet.to_packet()).await {
            requests.unregister_request(request_id);
            return Err(e.into());
        }

        let timeout = local.config().node.request_timeout();
        match requests.wait_request(request_id, Some(timeout)).await? {
            Reply::Value(INVALID_ID) => Err(Error::IdsExhausted),
            Reply::Value(id) => Ok(id),
            _ => Err(Error::IdsExhausted),
        }
    }

    /// 向等待中的请求交付结果
    pub(crate) fn serve(&self, request_id: u32, reply: Reply) {
        let local = match self.local_node() {
            Ok(local) => local,
            Err(_) => return,
        };
        if let Err(e) = local.core().requests.serve_request(request_id, reply) {
            warn!("session {}: {}", self.id, e);
        }
    }

    pub(crate) async fn dispatch(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, node::Error> {
        match (packet.datatype(), packet.command()) {
            (DATATYPE_SESSION, CMD_SESSION_GEN_IDS) => {
                let request = SessionGenIdsPacket::read_from(packet)?;
                let id = if self.is_master {
                    self.alloc_ids(request.range).unwrap_or(INVALID_ID)
                } else {
                    INVALID_ID
                };
                let reply = SessionGenIdsReplyPacket {
                    session_id: self.id,
                    request_id: request.request_id,
                    id,
                };
                node.send(&reply.to_packet()).await?;
                Ok(CommandResult::Handled)
            }
            (DATATYPE_SESSION, CMD_SESSION_GEN_IDS_REPLY) => {
                let reply = SessionGenIdsReplyPacket::read_from(packet)?;
                self.serve(reply.request_id, Reply::Value(reply.id));
                Ok(CommandResult::Handled)
            }
            (DATATYPE_OBJECT, CMD_OBJECT_SUBSCRIBE_REPLY) => {
                let reply = ObjectSubscribeReplyPacket::read_from(packet)?;
                let result = if reply.result {
                    Reply::Subscribed {
                        version: reply.version,
                    }
                } else {
                    Reply::Failed
                };
                self.serve(reply.request_id, result);
                Ok(CommandResult::Handled)
            }
            (DATATYPE_MOBJECT, CMD_BARRIER_ENTER_REPLY) => {
                let reply = BarrierPacket::read_from(packet)?;
                // 等待者超时后到达的放行被忽略
                let local = match self.local_node() {
                    Ok(local) => local,
                    Err(_) => return Ok(CommandResult::Handled),
                };
                if local
                    .core()
                    .requests
                    .serve_request(reply.request_id, Reply::Done)
                    .is_err()
                {
                    debug!("barrier {} late release {}", reply.object_id, reply.request_id);
                }
                Ok(CommandResult::Handled)
            }
            (DATATYPE_OBJECT, _) | (DATATYPE_MOBJECT, _) => {
                self.dispatch_object(node, packet).await
            }
            (DATATYPE_USER, _) => {
                let id = object_id(packet)?;
                let handler = lock(&self.users).get(&id).cloned();
                match handler {
                    Some(handler) => handler.dispatch(node, packet).await,
                    None => Ok(CommandResult::Reschedule),
                }
            }
            (datatype, command) => Err(node::Error::UnknownCommand { datatype, command }),
        }
    }

    async fn dispatch_object(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, node::Error> {
        let id = object_id(packet)?;
        let handler = lock(&self.objects).get(&id).cloned();
        if let Some(handler) = handler {
            return handler.dispatch(node, packet).await;
        }
        if lock(&self.detached).contains(&id) {
            debug!("drop packet {:?} for detached object {}", packet, id);
            return Ok(CommandResult::Handled);
        }
        if packet.datatype() == DATATYPE_OBJECT && packet.command() == CMD_OBJECT_SUBSCRIBE {
            let request = ObjectSubscribePacket::read_from(packet)?;
            warn!("subscribe to unknown object {} in session {}", id, self.id);
            let reply = ObjectSubscribeReplyPacket {
                session_id: self.id,
                object_id: id,
                request_id: request.request_id,
                result: false,
                version: 0,
            };
            node.send(&reply.to_packet()).await?;
            return Ok(CommandResult::Handled);
        }
        // 对象可能还没有注册
        Ok(CommandResult::Reschedule)
    }

    /// 注册对象的报文处理器
    pub fn register_object(&self, id: u32, handler: Arc<dyn Dispatch>) {
        lock(&self.detached).remove(&id);
        lock(&self.objects).insert(id, handler);
    }

    /// 注销对象，之后到达的报文被丢弃
    pub fn deregister_object(&self, id: u32) -> bool {
        lock(&self.detached).insert(id);
        lock(&self.objects).remove(&id).is_some()
    }

    /// 注册用户报文处理器，返回分配到的 user id
    pub async fn register_user(&self, handler: Arc<dyn Dispatch>) -> Result<u32, Error> {
        let id = self.gen_ids(1).await?;
        lock(&self.users).insert(id, handler);
        Ok(id)
    }

    pub fn deregister_user(&self, id: u32) -> bool {
        lock(&self.users).remove(&id).is_some()
    }

    /// 向节点发送用户报文
    pub async fn send_user(
        &self,
        node: &Node,
        user_id: u32,
        command: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let packet = UserPacket {
            session_id: self.id,
            user_id,
            command,
            data: data.to_vec(),
        };
        node.send(&packet.to_packet()).await?;
        Ok(())
    }

    pub(crate) async fn node_disconnected(&self, node: NodeId) {
        let handlers: Vec<Arc<dyn Dispatch>> = lock(&self.objects)
            .values()
            .chain(lock(&self.users).values())
            .cloned()
            .collect();
        for handler in handlers {
            handler.node_disconnected(node).await;
        }
    }

    /// 在本节点注册一个主对象
    pub async fn register_master<T: Distributed>(
        self: &Arc<Self>,
        data: T,
    ) -> Result<Arc<MasterObject<T>>, object::Error> {
        MasterObject::register(self, data).await
    }

    /// 映射 master 上的主对象，返回同步到订阅版本的从对象
    pub async fn map_object<T: Distributed>(
        self: &Arc<Self>,
        id: u32,
        master: &Arc<Node>,
        data: T,
    ) -> Result<SlaveObject<T>, object::Error> {
        SlaveObject::map(self, id, master, data).await
    }

    /// 创建一个传输协议的网络
    pub fn add_network(&self, protocol: Protocol) -> Arc<Network> {
        let network = Arc::new(Network::new(protocol, self.local.clone()));
        lock(&self.networks).push(network.clone());
        network
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        lock(&self.networks).clone()
    }

    pub fn remove_network(&self, network: &Arc<Network>) -> bool {
        let mut networks = lock(&self.networks);
        let len = networks.len();
        networks.retain(|n| !Arc::ptr_eq(n, network));
        networks.len() != len
    }

    /// 初始化所有网络
    pub fn init(&self) {
        for network in self.networks() {
            network.init();
        }
    }

    /// 启动所有网络，任意一个失败则整体失败，已启动的节点保持运行
    pub async fn start(&self) -> Result<(), Error> {
        for network in self.networks() {
            network.start().await?;
        }
        info!("session {} '{}' started", self.id, self.name);
        Ok(())
    }

    pub async fn stop(&self) {
        for network in self.networks() {
            network.stop().await;
        }
    }

    pub async fn exit(&self) {
        for network in self.networks() {
            network.exit().await;
        }
    }

    /// 创建以本节点为主的屏障
    pub async fn create_barrier(self: &Arc<Self>, height: u32) -> Result<Arc<Barrier>, Error> {
        let local = self.local_node()?;
        let id = self.gen_ids(1).await?;
        let barrier = Arc::new(Barrier::new(
            id,
            self.id,
            height,
            local.self_node()?,
            self.local.clone(),
        ));
        self.register_object(id, barrier.clone());
        Ok(barrier)
    }

    /// 映射 master 上的屏障
    pub fn map_barrier(&self, id: u32, master: &Arc<Node>) -> Result<Arc<Barrier>, Error> {
        let local = self.local_node()?;
        if local.state() != NodeState::Listening {
            return Err(node::Error::InvalidState(local.state()).into());
        }
        Ok(Arc::new(Barrier::new(
            id,
            self.id,
            0,
            master.clone(),
            self.local.clone(),
        )))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("server", &self.server.id())
            .field("is_master", &self.is_master)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, context::Context, network::Connection};

    async fn master_session() -> (LocalNode, Arc<Session>) {
        let local = LocalNode::new(Context::new("test"), Config::default());
        local.listen(None).await.unwrap();
        let session = local
            .map_session(&local.self_node().unwrap(), "test")
            .await
            .unwrap();
        (local, session)
    }

    #[tokio::test]
    async fn master_allocates_ids() {
        let (local, session) = master_session().await;
        assert_eq!(session.gen_ids(1).await.unwrap(), 1);
        assert_eq!(session.gen_ids(10).await.unwrap(), 2);
        assert_eq!(session.gen_ids(1).await.unwrap(), 12);
        assert!(matches!(
            session.gen_ids(0).await,
            Err(Error::InvalidRange(0))
        ));
        local.stop_listening().await.unwrap();
    }

    #[tokio::test]
    async fn ids_exhausted() {
        let (local, session) = master_session().await;
        *lock(&session.next_id) = INVALID_ID - 2;
        assert_eq!(session.gen_ids(2).await.unwrap(), INVALID_ID - 2);
        assert!(matches!(session.gen_ids(1).await, Err(Error::IdsExhausted)));
        local.stop_listening().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_unknown_object_fails() {
        let (local, session) = master_session().await;
        let peer = local.create_node();
        let conn = Arc::new(Connection::pipe());
        peer.set_connection(conn.clone());
        peer.set_state(NodeState::Connected);

        let subscribe = ObjectSubscribePacket {
            session_id: session.id(),
            object_id: 42,
            request_id: 3,
        };
        let result = session
            .dispatch(&peer, &subscribe.to_packet())
            .await
            .unwrap();
        assert_eq!(result, CommandResult::Handled);

        let reply = ObjectSubscribeReplyPacket::read_from(&conn.recv_packet(1024).await.unwrap())
            .unwrap();
        assert_eq!(reply.request_id, 3);
        assert!(!reply.result);
        local.stop_listening().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_object_rescheduled_detached_dropped() {
        let (local, session) = master_session().await;
        let peer = local.self_node().unwrap();
        let packet = crate::network::packet::object::ObjectUnsubscribePacket {
            session_id: session.id(),
            object_id: 5,
        }
        .to_packet();

        assert_eq!(
            session.dispatch(&peer, &packet).await.unwrap(),
            CommandResult::Reschedule
        );
        session.deregister_object(5);
        assert_eq!(
            session.dispatch(&peer, &packet).await.unwrap(),
            CommandResult::Handled
        );
        local.stop_listening().await.unwrap();
    }
}
