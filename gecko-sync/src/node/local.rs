use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    context::Context,
    lock,
    network::{
        packet::{
            self,
            node::{
                NodeCommand, NodeConnectPacket, NodeMapSessionPacket, NodeMapSessionReplyPacket,
                NodeStopPacket, CMD_NODE_CUSTOM,
            },
            session::session_id,
            DATATYPE_CUSTOM, DATATYPE_MOBJECT, DATATYPE_NODE, DATATYPE_OBJECT, DATATYPE_SESSION,
            DATATYPE_USER, INVALID_ID,
        },
        Connection, ConnectionDescription, ConnectionSet, Packet, Protocol,
    },
    request::RequestHandler,
    session::Session,
    Hook, HookNoop,
};

use super::{
    launch, receiver, CommandResult, Dispatch, Error, Node, NodeId, NodeState, PendingRequest,
    Reply, RequestKind,
};

/// 本地节点的 id，对端节点从 1 开始编号
const LOCAL_NODE_ID: NodeId = NodeId(0);

/// 远程启动后等待回连的请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLaunch {
    pub request_id: u32,
    pub timeout: Duration,
}

pub(crate) struct NodeCore {
    id: NodeId,
    ctx: Context,
    config: Config,
    state: Mutex<NodeState>,
    pub(crate) conn_set: ConnectionSet<NodeId>,
    nodes: Mutex<HashMap<NodeId, Arc<Node>>>,
    next_node_id: AtomicU32,
    pub(crate) requests: RequestHandler<PendingRequest, Reply>,
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    commands: Mutex<HashMap<(u32, u32), Arc<dyn Dispatch>>>,
    listener: Mutex<Option<Arc<Connection>>>,
    self_node: Mutex<Option<Arc<Node>>>,
    receiver: tokio::sync::Mutex<Option<JoinHandle<Result<(), Error>>>>,
    hook: Arc<dyn Hook>,
}

/// 本地节点
///
/// 监听后拥有一个接收任务，所有进入本进程的报文都在该任务中派发。
/// 句柄可以被复制，所有副本共享同一个节点。
#[derive(Clone)]
pub struct LocalNode {
    core: Arc<NodeCore>,
}

impl LocalNode {
    pub fn new(ctx: Context, config: Config) -> Self {
        Self::with_hook(ctx, config, Arc::new(HookNoop))
    }

    pub fn with_hook(ctx: Context, config: Config, hook: Arc<dyn Hook>) -> Self {
        let requests = &config.request;
        debug!(
            "request cache: small packet {} bytes, {} pooled",
            requests.small_packet_size, requests.max_pooled
        );
        Self {
            core: Arc::new(NodeCore {
                id: LOCAL_NODE_ID,
                ctx,
                config,
                state: Mutex::new(NodeState::Stopped),
                conn_set: ConnectionSet::new(),
                nodes: Mutex::new(HashMap::new()),
                next_node_id: AtomicU32::new(LOCAL_NODE_ID.0 + 1),
                requests: RequestHandler::new(),
                sessions: Mutex::new(HashMap::new()),
                commands: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                self_node: Mutex::new(None),
                receiver: tokio::sync::Mutex::new(None),
                hook,
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeCore> {
        Arc::downgrade(&self.core)
    }

    pub(crate) fn upgrade(weak: &Weak<NodeCore>) -> Option<Self> {
        weak.upgrade().map(|core| Self { core })
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.core.state)
    }

    fn set_state(&self, state: NodeState) {
        *lock(&self.core.state) = state;
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn context(&self) -> &Context {
        &self.core.ctx
    }

    pub(crate) fn hook(&self) -> &Arc<dyn Hook> {
        &self.core.hook
    }

    /// 监听连接
    pub fn listener(&self) -> Option<Arc<Connection>> {
        lock(&self.core.listener).clone()
    }

    /// 本地节点自己的代理，发往它的报文由接收任务派发
    pub fn self_node(&self) -> Result<Arc<Node>, Error> {
        lock(&self.core.self_node)
            .clone()
            .ok_or(Error::InvalidState(self.state()))
    }

    /// 开始监听并启动接收任务
    ///
    /// 未指定监听连接时使用配置中的监听地址，都没有时只创建回环管道
    pub async fn listen(&self, conn: Option<Connection>) -> Result<(), Error> {
        if self.state() != NodeState::Stopped {
            return Err(Error::InvalidState(self.state()));
        }

        let listener = match conn {
            Some(conn) => Some(conn),
            None => self
                .config()
                .node
                .listen
                .as_deref()
                .map(str::parse::<ConnectionDescription>)
                .transpose()?
                .map(Connection::new),
        };
        if let Some(listener) = listener {
            if !listener.is_listening() {
                listener.listen().await?;
            }
            let listener = Arc::new(listener);
            info!("{} listening on {}", self.id(), listener.description());
            self.core
                .conn_set
                .add_connection(listener.clone(), self.id());
            *lock(&self.core.listener) = Some(listener);
        }

        let self_node = Arc::new(Node::new(self.id()));
        self.attach(&self_node, Arc::new(Connection::pipe()));
        *lock(&self.core.self_node) = Some(self_node);

        self.set_state(NodeState::Listening);
        let handle = tokio::spawn(receiver::run(self.clone()));
        *self.core.receiver.lock().await = Some(handle);
        Ok(())
    }

    /// 停止接收任务，断开所有节点
    pub async fn stop_listening(&self) -> Result<(), Error> {
        if self.state() != NodeState::Listening {
            return Err(Error::InvalidState(self.state()));
        }
        self.self_node()?.send(&NodeStopPacket.to_packet()).await?;
        self.join().await
    }

    /// 等待接收任务结束
    pub async fn join(&self) -> Result<(), Error> {
        let handle = self.core.receiver.lock().await.take();
        match handle {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// 创建一个新的节点代理，此时还未连接
    pub fn create_node(&self) -> Arc<Node> {
        let id = self.core.next_node_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Node::new(NodeId(id)))
    }

    /// 为配置文件中的每个对端创建节点代理
    pub fn create_peer_nodes(&self) -> Result<Vec<Arc<Node>>, Error> {
        let config = self.config();
        config
            .peers
            .iter()
            .map(|peer| {
                let node = self.create_node();
                node.add_description(peer.description(&config.node)?);
                node.set_auto_launch(peer.auto_launch);
                Ok(node)
            })
            .collect()
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        lock(&self.core.nodes).get(&id).cloned()
    }

    /// 所有已连接或正在启动的对端节点
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.core.nodes)
            .values()
            .filter(|node| node.id() != self.id())
            .cloned()
            .collect()
    }

    pub(crate) fn attach(&self, node: &Arc<Node>, conn: Arc<Connection>) {
        node.set_connection(conn.clone());
        node.set_state(NodeState::Connected);
        lock(&self.core.nodes).insert(node.id(), node.clone());
        self.core.conn_set.add_connection(conn, node.id());
    }

    /// 使用已建立的连接连接节点，并发送握手报文
    ///
    /// 管道连接的两端都需要调用此方法
    pub async fn connect(&self, node: &Arc<Node>, conn: Connection) -> Result<(), Error> {
        if self.state() != NodeState::Listening {
            return Err(Error::InvalidState(self.state()));
        }
        if node.is_connected() {
            return Ok(());
        }
        if !conn.is_connected() {
            return Err(Error::NotConnected(node.id()));
        }

        let handshake = NodeConnectPacket {
            was_launched: false,
            launch_id: 0,
        };
        conn.send_packet(&handshake.to_packet()).await?;
        self.attach(node, Arc::new(conn));
        info!("{} connected", node.id());
        self.hook().connected(node.id()).await;
        Ok(())
    }

    /// 断开节点
    pub async fn disconnect(&self, node: &Arc<Node>) -> Result<(), Error> {
        if node.id() == self.id() {
            return Err(Error::InvalidState(self.state()));
        }
        if node.connection().is_none() {
            return Err(Error::NotConnected(node.id()));
        }
        self.remove_node(node).await;
        Ok(())
    }

    /// 连接的非阻塞阶段：直接连接节点的某个描述，或者远程启动节点
    ///
    /// 远程启动时返回需要等待的请求，交给 sync_connect
    pub async fn init_connect(&self, node: &Arc<Node>) -> Result<Option<PendingLaunch>, Error> {
        if self.state() != NodeState::Listening {
            return Err(Error::InvalidState(self.state()));
        }
        match node.state() {
            NodeState::Connected if node.is_connected() => return Ok(None),
            NodeState::Launched | NodeState::Listening => {
                return Err(Error::InvalidState(node.state()))
            }
            _ => {}
        }

        let descriptions = node.descriptions();
        for description in &descriptions {
            if description.protocol == Protocol::Pipe {
                continue;
            }
            let conn = Connection::new(description.clone());
            match conn.connect().await {
                Ok(()) => {
                    self.connect(node, conn).await?;
                    return Ok(None);
                }
                Err(e) => debug!("connect {} via {} failed: {}", node.id(), description, e),
            }
        }

        if !node.auto_launch() {
            return Err(Error::ConnectFailed(node.id()));
        }
        self.launch(node, &descriptions).await.map(Some)
    }

    async fn launch(
        &self,
        node: &Arc<Node>,
        descriptions: &[ConnectionDescription],
    ) -> Result<PendingLaunch, Error> {
        let launch_failed = |reason: &str| Error::LaunchFailed {
            node: node.id(),
            reason: reason.to_string(),
        };
        let listener = self
            .listener()
            .filter(|listener| listener.is_listening())
            .ok_or_else(|| launch_failed("local node is not listening"))?;
        let description = descriptions
            .iter()
            .find(|desc| {
                desc.protocol == Protocol::Tcp
                    && desc.launch_command.as_deref().map_or(false, |c| !c.is_empty())
            })
            .ok_or_else(|| launch_failed("no launch command"))?;
        let template = description.launch_command.as_deref().unwrap_or_default();

        let request_id = self.core.requests.register_request(PendingRequest {
            node: node.id(),
            kind: RequestKind::Launch,
        });
        let remote = launch::remote_command(&self.core.ctx, &listener.description(), request_id);
        let command = launch::launch_command(template, &description.hostname, &remote);

        // 回连时需要找到此节点
        lock(&self.core.nodes).insert(node.id(), node.clone());
        if let Err(e) = launch::launch(&command) {
            self.core.requests.unregister_request(request_id);
            lock(&self.core.nodes).remove(&node.id());
            return Err(launch_failed(&e.to_string()));
        }
        node.set_state(NodeState::Launched);
        Ok(PendingLaunch {
            request_id,
            timeout: description.launch_timeout,
        })
    }

    /// 连接的阻塞阶段：等待被启动的节点回连
    pub async fn sync_connect(&self, node: &Arc<Node>, launch: PendingLaunch) -> Result<(), Error> {
        let res = self
            .core
            .requests
            .wait_request(launch.request_id, Some(launch.timeout))
            .await;
        match res {
            Ok(Reply::Done) if node.is_connected() => Ok(()),
            res => {
                warn!("{} launch failed: {:?}", node.id(), res);
                if !node.is_connected() {
                    node.set_state(NodeState::Stopped);
                    lock(&self.core.nodes).remove(&node.id());
                }
                Err(Error::LaunchTimeout(node.id()))
            }
        }
    }

    /// 连接节点，必要时远程启动并等待回连
    pub async fn connect_node(&self, node: &Arc<Node>) -> Result<(), Error> {
        match self.init_connect(node).await? {
            Some(launch) => self.sync_connect(node, launch).await,
            None => Ok(()),
        }
    }

    /// 被远程启动的进程的入口，参数为 `<request_id>:<address>`
    ///
    /// 回连启动者并完成握手，返回启动者的节点代理
    pub async fn run_client(&self, arg: &str) -> Result<Arc<Node>, Error> {
        let (request_id, description) = launch::parse_client_arg(arg)
            .ok_or_else(|| Error::InvalidClientArg(arg.to_string()))?;
        if self.state() == NodeState::Stopped {
            self.listen(None).await?;
        }

        let server = self.create_node();
        server.add_description(description.clone());
        let conn = Connection::new(description);
        conn.connect().await?;
        let handshake = NodeConnectPacket {
            was_launched: true,
            launch_id: request_id as u64,
        };
        conn.send_packet(&handshake.to_packet()).await?;
        self.attach(&server, Arc::new(conn));
        info!("client connected to launcher {}", server.id());
        self.hook().connected(server.id()).await;
        Ok(server)
    }

    /// 回连的握手报文到达
    pub(crate) async fn complete_launch(&self, launch_id: u64, conn: Arc<Connection>) {
        let pending = u32::try_from(launch_id)
            .ok()
            .and_then(|id| self.core.requests.request_data(id).map(|data| (id, data)));
        let (request_id, node) = match pending {
            Some((
                request_id,
                PendingRequest {
                    node,
                    kind: RequestKind::Launch,
                },
            )) => (request_id, node),
            _ => {
                warn!("{}", Error::UnknownLaunch(launch_id));
                conn.close();
                return;
            }
        };
        let node = match self.node(node) {
            Some(node) => node,
            None => {
                warn!("launched {} no longer registered", node);
                conn.close();
                return;
            }
        };

        self.attach(&node, conn);
        info!("launched {} connected", node.id());
        self.hook().connected(node.id()).await;
        if let Err(e) = self.core.requests.serve_request(request_id, Reply::Done) {
            warn!("serve launch request failed: {}", e);
        }
    }

    /// 清理断开的节点：关闭连接，通知会话和回调，取消等待此节点的请求
    pub(crate) async fn remove_node(&self, node: &Arc<Node>) {
        let id = node.id();
        if let Some(conn) = node.take_connection() {
            self.core.conn_set.remove_connection(&conn);
            conn.close();
        }
        node.set_state(NodeState::Stopped);
        if lock(&self.core.nodes).remove(&id).is_none() {
            return;
        }

        self.core.requests.retain(|request| request.node != id);
        for session in self.sessions() {
            session.node_disconnected(id).await;
        }
        info!("{} disconnected", id);
        self.hook().disconnected(id).await;
    }

    /// 接收任务退出时释放所有资源
    pub(crate) async fn shutdown(&self) {
        self.set_state(NodeState::Stopped);
        let nodes: Vec<Arc<Node>> = lock(&self.core.nodes).drain().map(|(_, n)| n).collect();
        let sessions = self.sessions();
        for node in nodes {
            if let Some(conn) = node.take_connection() {
                conn.close();
            }
            node.set_state(NodeState::Stopped);
            if node.id() == self.id() {
                continue;
            }
            for session in &sessions {
                session.node_disconnected(node.id()).await;
            }
            self.hook().disconnected(node.id()).await;
        }

        for conn in self.core.conn_set.connections() {
            conn.close();
        }
        self.core.conn_set.clear();
        lock(&self.core.listener).take();
        lock(&self.core.self_node).take();
        self.core.requests.retain(|_| false);
        lock(&self.core.sessions).clear();
        info!("{} stopped", self.id());
    }

    pub fn session(&self, id: u32) -> Option<Arc<Session>> {
        lock(&self.core.sessions).get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.core.sessions).values().cloned().collect()
    }

    /// 查找或创建本地的主会话
    fn local_session(&self, name: &str) -> Result<Arc<Session>, Error> {
        let server = self.self_node()?;
        let mut sessions = lock(&self.core.sessions);
        if let Some(session) = sessions
            .values()
            .find(|s| s.is_master() && s.name() == name)
        {
            return Ok(session.clone());
        }

        let mut id = fastrand::u32(..);
        while id == INVALID_ID || sessions.contains_key(&id) {
            id = fastrand::u32(..);
        }
        let session = Session::new(id, name, server, true, self.downgrade());
        sessions.insert(id, session.clone());
        info!("created session {} '{}'", id, name);
        Ok(session)
    }

    /// 按名称映射会话
    ///
    /// server 为本地节点时查找或创建主会话，否则向 server 请求映射
    pub async fn map_session(&self, server: &Arc<Node>, name: &str) -> Result<Arc<Session>, Error> {
        if server.id() == self.id() {
            return self.local_session(name);
        }
        if let Some(session) = self
            .sessions()
            .into_iter()
            .find(|s| s.server().id() == server.id() && s.name() == name)
        {
            return Ok(session);
        }
        self.request_session(server, INVALID_ID, name).await
    }

    /// 按 id 映射会话
    pub async fn map_session_by_id(&self, server: &Arc<Node>, id: u32) -> Result<Arc<Session>, Error> {
        if let Some(session) = self.session(id) {
            if session.server().id() == server.id() {
                return Ok(session);
            }
        }
        if server.id() == self.id() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        self.request_session(server, id, "").await
    }

    async fn request_session(
        &self,
        server: &Arc<Node>,
        session_id: u32,
        name: &str,
    ) -> Result<Arc<Session>, Error> {
        let requests = &self.core.requests;
        let request_id = requests.register_request(PendingRequest {
            node: server.id(),
            kind: RequestKind::MapSession,
        });
        let packet = NodeMapSessionPacket {
            request_id,
            session_id,
            name: name.to_string(),
        };
        if let Err(e) = server.send(&packet.to_packet()).await {
            requests.unregister_request(request_id);
            return Err(e);
        }

        let timeout = self.config().node.request_timeout();
        let not_found = || {
            if name.is_empty() {
                Error::SessionNotFound(session_id.to_string())
            } else {
                Error::SessionNotFound(name.to_string())
            }
        };
        match requests.wait_request(request_id, Some(timeout)).await? {
            Reply::Value(id) => self.session(id).ok_or_else(not_found),
            _ => Err(not_found()),
        }
    }

    /// 移除本地的会话映射
    pub fn unmap_session(&self, session: &Arc<Session>) -> bool {
        lock(&self.core.sessions).remove(&session.id()).is_some()
    }

    /// 注册自定义命令
    ///
    /// 只允许 DATATYPE_CUSTOM 及以上的 datatype，或 CMD_NODE_CUSTOM 及以上的节点命令
    pub fn register_command(
        &self,
        datatype: u32,
        command: u32,
        handler: Arc<dyn Dispatch>,
    ) -> Result<(), Error> {
        let allowed = datatype >= DATATYPE_CUSTOM
            || (datatype == DATATYPE_NODE && command >= CMD_NODE_CUSTOM);
        if !allowed {
            return Err(Error::ReservedCommand { datatype, command });
        }
        lock(&self.core.commands).insert((datatype, command), handler);
        Ok(())
    }

    /// 按 datatype 把报文派发给节点命令，会话或自定义命令
    pub async fn dispatch_packet(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, Error> {
        match packet.datatype() {
            DATATYPE_NODE => self.dispatch_node_command(node, packet).await,
            DATATYPE_SESSION | DATATYPE_OBJECT | DATATYPE_MOBJECT | DATATYPE_USER => {
                let id = session_id(packet)?;
                let session = self
                    .session(id)
                    .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
                session.dispatch(node, packet).await
            }
            _ => self.dispatch_custom(node, packet).await,
        }
    }

    async fn dispatch_custom(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, Error> {
        let (datatype, command) = (packet.datatype(), packet.command());
        let handler = lock(&self.core.commands)
            .get(&(datatype, command))
            .cloned()
            .ok_or(Error::UnknownCommand { datatype, command })?;
        handler.dispatch(node, packet).await
    }

    async fn dispatch_node_command(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, Error> {
        match packet::node::NodeCommand::read_from(packet)? {
            NodeCommand::Stop => {
                if node.id() != self.id() {
                    return Err(Error::Packet(packet::Error::UnexpectedPacket {
                        datatype: packet.datatype(),
                        command: packet.command(),
                    }));
                }
                debug!("{} received stop", self.id());
                self.set_state(NodeState::Stopped);
            }
            NodeCommand::Message(message) => {
                self.hook()
                    .message(node.id(), message.kind, &message.data)
                    .await;
            }
            NodeCommand::MapSession(request) => {
                let reply = self.serve_map_session(&request);
                node.send(&reply.to_packet()).await?;
            }
            NodeCommand::MapSessionReply(reply) => {
                let result = if reply.session_id == INVALID_ID {
                    Reply::Failed
                } else {
                    let mut sessions = lock(&self.core.sessions);
                    sessions.entry(reply.session_id).or_insert_with(|| {
                        info!("mapped session {} '{}'", reply.session_id, reply.name);
                        Session::new(
                            reply.session_id,
                            &reply.name,
                            node.clone(),
                            false,
                            self.downgrade(),
                        )
                    });
                    Reply::Value(reply.session_id)
                };
                if let Err(e) = self.core.requests.serve_request(reply.request_id, result) {
                    warn!("map session reply: {}", e);
                }
            }
            NodeCommand::Connect(handshake) => {
                // 双方都主动连接时会收到对端的握手
                debug!("{} handshake {:?}", node.id(), handshake);
            }
            NodeCommand::Custom(_) => return self.dispatch_custom(node, packet).await,
        }
        Ok(CommandResult::Handled)
    }

    fn serve_map_session(&self, request: &NodeMapSessionPacket) -> NodeMapSessionReplyPacket {
        let session = if request.session_id == INVALID_ID {
            self.local_session(&request.name).ok()
        } else {
            self.session(request.session_id).filter(|s| s.is_master())
        };
        match session {
            Some(session) => NodeMapSessionReplyPacket {
                request_id: request.request_id,
                session_id: session.id(),
                name: session.name().to_string(),
            },
            None => NodeMapSessionReplyPacket::failed(request.request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::DATATYPE_USER;

    fn local_node() -> LocalNode {
        LocalNode::new(Context::new("test"), Config::default())
    }

    struct Echo;

    #[async_trait::async_trait]
    impl Dispatch for Echo {
        async fn dispatch(
            &self,
            node: &Arc<Node>,
            packet: &Packet,
        ) -> Result<CommandResult, Error> {
            node.send(&Packet::new(DATATYPE_CUSTOM + 1, 0, packet.body()))
                .await?;
            Ok(CommandResult::Handled)
        }
    }

    #[tokio::test]
    async fn listen_and_stop() {
        let node = local_node();
        node.listen(None).await.unwrap();
        assert_eq!(node.state(), NodeState::Listening);
        assert!(node.listener().is_none());
        assert!(node.self_node().unwrap().is_connected());
        assert!(matches!(
            node.listen(None).await,
            Err(Error::InvalidState(NodeState::Listening))
        ));

        node.stop_listening().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.self_node().is_err());
        assert!(node.core().conn_set.is_empty());
    }

    #[tokio::test]
    async fn reserved_commands_rejected() {
        let node = local_node();
        assert!(node
            .register_command(DATATYPE_USER, 0, Arc::new(Echo))
            .is_err());
        assert!(node
            .register_command(DATATYPE_NODE, 3, Arc::new(Echo))
            .is_err());
        assert!(node
            .register_command(DATATYPE_NODE, CMD_NODE_CUSTOM, Arc::new(Echo))
            .is_ok());
        assert!(node
            .register_command(DATATYPE_CUSTOM, 5, Arc::new(Echo))
            .is_ok());
    }

    #[tokio::test]
    async fn custom_command_dispatch() {
        let node = local_node();
        node.register_command(DATATYPE_CUSTOM, 1, Arc::new(Echo))
            .unwrap();

        let peer = node.create_node();
        let conn = Arc::new(Connection::pipe());
        peer.set_connection(conn.clone());
        peer.set_state(NodeState::Connected);

        let packet = Packet::new(DATATYPE_CUSTOM, 1, b"abc");
        assert_eq!(
            node.dispatch_packet(&peer, &packet).await.unwrap(),
            CommandResult::Handled
        );
        let echoed = conn.recv_packet(1024).await.unwrap();
        assert_eq!(echoed.datatype(), DATATYPE_CUSTOM + 1);
        assert_eq!(echoed.body(), b"abc");

        assert!(matches!(
            node.dispatch_packet(&peer, &Packet::new(DATATYPE_CUSTOM, 2, &[]))
                .await,
            Err(Error::UnknownCommand { command: 2, .. })
        ));
    }

    #[tokio::test]
    async fn local_session_created_once() {
        let node = local_node();
        node.listen(None).await.unwrap();
        let self_node = node.self_node().unwrap();
        let a = node.map_session(&self_node, "nbody").await.unwrap();
        let b = node.map_session(&self_node, "nbody").await.unwrap();
        assert_eq!(a.id(), b.id());
        assert!(a.is_master());
        assert_ne!(a.id(), INVALID_ID);
        assert!(node
            .map_session_by_id(&self_node, a.id().wrapping_add(1))
            .await
            .is_err());
        node.stop_listening().await.unwrap();
    }

    #[tokio::test]
    async fn connect_without_description_fails() {
        let node = local_node();
        node.listen(None).await.unwrap();
        let peer = node.create_node();
        assert!(matches!(
            node.connect_node(&peer).await,
            Err(Error::ConnectFailed(_))
        ));
        peer.set_auto_launch(true);
        assert!(matches!(
            node.connect_node(&peer).await,
            Err(Error::LaunchFailed { .. })
        ));
        node.stop_listening().await.unwrap();
    }
}
