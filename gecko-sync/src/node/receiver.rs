//! 接收任务
//!
//! 每次从连接集合取出一个事件处理，处理完后重新派发之前暂缓的报文。
//! 暂缓的报文保持到达顺序，数量超过上限时断开发送它们的节点。
//! 同一个对象的报文只要有一个被暂缓，之后到达的都排在它后面。

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use log::{debug, error, info, trace, warn};
use tokio::time::timeout;

use crate::{
    config::NodeConfig,
    network::{
        packet::{
            node::NodeConnectPacket,
            object::{object_id, CMD_BARRIER_ENTER_REPLY, CMD_OBJECT_SUBSCRIBE_REPLY},
            session::session_id,
            DATATYPE_MOBJECT, DATATYPE_OBJECT, DATATYPE_USER,
        },
        Connection, Event, Packet,
    },
    request::{Request, RequestCache},
};

use super::{CommandResult, Error, LocalNode, NodeId, NodeState};

pub(crate) async fn run(node: LocalNode) -> Result<(), Error> {
    let config = node.config().node.clone();
    let mut receiver = Receiver {
        cache: RequestCache::new(
            node.config().request.small_packet_size,
            node.config().request.max_pooled,
        ),
        pending: VecDeque::new(),
        node,
        config,
    };
    info!("{} receiver started", receiver.node.id());

    let res = receiver.run().await;
    receiver.node.shutdown().await;
    if let Err(e) = &res {
        error!("receiver stopped: {}", e);
    }
    res
}

struct Receiver {
    node: LocalNode,
    config: NodeConfig,
    cache: RequestCache,
    pending: VecDeque<Request>,
}

impl Receiver {
    async fn run(&mut self) -> Result<(), Error> {
        while self.node.state() == NodeState::Listening {
            let wait = if self.pending.is_empty() {
                None
            } else {
                Some(self.config.redispatch_interval())
            };
            match self.node.core().conn_set.select(wait).await {
                Event::Timeout => {}
                Event::Error(e) => return Err(Error::Select(e)),
                Event::Connect(listener) => self.handle_connect(&listener).await,
                Event::Data(conn) => self.handle_data(&conn).await,
                Event::Disconnect(conn) => self.handle_disconnect(&conn).await,
            }
            self.redispatch().await;
        }
        Ok(())
    }

    /// 接受新连接，第一个报文必须是握手报文
    async fn handle_connect(&mut self, listener: &Arc<Connection>) {
        let conn = match listener.accept().await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!("accept error: {}", e);
                return;
            }
        };

        let received = timeout(
            self.config.handshake_timeout(),
            conn.recv_packet(self.config.max_packet_size),
        )
        .await;
        let handshake = match received {
            Ok(Ok(packet)) => NodeConnectPacket::read_from(&packet).map_err(|e| e.to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timeout".to_string()),
        };
        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("{}: {}", Error::Handshake, e);
                conn.close();
                return;
            }
        };

        if handshake.was_launched {
            self.node.complete_launch(handshake.launch_id, conn).await;
        } else {
            let peer = self.node.create_node();
            self.node.attach(&peer, conn);
            info!("{} connected", peer.id());
            self.node.hook().connected(peer.id()).await;
        }
    }

    async fn handle_data(&mut self, conn: &Arc<Connection>) {
        let core = self.node.core().clone();
        let owner = match core.conn_set.owner(conn) {
            Some(owner) => owner,
            None => return,
        };
        let peer = match self.node.node(owner) {
            Some(peer) => peer,
            None => {
                core.conn_set.remove_connection(conn);
                conn.close();
                return;
            }
        };

        let packet = match conn.recv_packet(self.config.max_packet_size).await {
            Ok(packet) => packet,
            Err(e) => {
                if e.is_disconnect() {
                    debug!("{} read error: {}", owner, e);
                } else {
                    error!("protocol error from {}: {}", owner, e);
                }
                self.disconnect(owner).await;
                return;
            }
        };
        trace!("{} received {:?}", owner, packet);

        let result = match ordering_key(&packet) {
            Some(key) if self.is_blocked(key) => {
                trace!("{:?} queued behind pending packets", packet);
                Ok(CommandResult::Reschedule)
            }
            _ => self.node.dispatch_packet(&peer, &packet).await,
        };
        match result {
            Ok(CommandResult::Handled) => {}
            Ok(CommandResult::Reschedule) => {
                if self.pending.len() >= self.config.max_pending_packets {
                    let overflow = Error::PendingOverflow(self.pending.len());
                    if owner == self.node.id() {
                        // 本地节点不能断开，只丢弃这个报文
                        error!("{}, dropping local {:?}", overflow, packet);
                    } else {
                        error!("{}, disconnecting {}", overflow, owner);
                        self.disconnect(owner).await;
                    }
                } else {
                    self.pending.push_back(self.cache.alloc(owner, &packet));
                }
            }
            Err(e) => {
                error!("dispatch {:?} from {} failed: {}", packet, owner, e);
                self.disconnect(owner).await;
            }
        }
    }

    async fn handle_disconnect(&mut self, conn: &Arc<Connection>) {
        let core = self.node.core().clone();
        if let Some(listener) = self.node.listener() {
            if Arc::ptr_eq(&listener, conn) {
                warn!("listener {} closed", listener.description());
                core.conn_set.remove_connection(conn);
                return;
            }
        }

        match core.conn_set.owner(conn) {
            Some(owner) if owner == self.node.id() => {
                // 回环管道关闭后无法再收到停止命令
                warn!("{} self connection closed", owner);
                core.conn_set.remove_connection(conn);
                self.node.shutdown().await;
            }
            Some(owner) => {
                if self.node.node(owner).is_none() {
                    core.conn_set.remove_connection(conn);
                }
                self.disconnect(owner).await;
            }
            None => {}
        }
    }

    /// 断开节点并丢弃它暂缓的报文，本地节点自身只记录日志
    async fn disconnect(&mut self, id: NodeId) {
        if id == self.node.id() {
            return;
        }
        if let Some(peer) = self.node.node(id) {
            self.node.remove_node(&peer).await;
        }
        self.drop_pending(id);
    }

    fn drop_pending(&mut self, id: NodeId) {
        let mut kept = VecDeque::with_capacity(self.pending.len());
        while let Some(request) = self.pending.pop_front() {
            if request.node == id {
                self.cache.release(request);
            } else {
                kept.push_back(request);
            }
        }
        self.pending = kept;
    }

    fn is_blocked(&self, key: OrderingKey) -> bool {
        self.pending
            .iter()
            .any(|request| ordering_key(&request.packet) == Some(key))
    }

    /// 按顺序重新派发暂缓的报文
    async fn redispatch(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let mut remaining = VecDeque::with_capacity(self.pending.len());
        // 本轮仍被暂缓的对象，后面同一对象的报文不能越过它
        let mut blocked = HashSet::new();
        while let Some(request) = self.pending.pop_front() {
            let peer = match self.node.node(request.node) {
                Some(peer) => peer,
                None => {
                    self.cache.release(request);
                    continue;
                }
            };
            let key = ordering_key(&request.packet);
            if let Some(key) = key {
                if blocked.contains(&key) {
                    remaining.push_back(request);
                    continue;
                }
            }
            match self.node.dispatch_packet(&peer, &request.packet).await {
                Ok(CommandResult::Handled) => self.cache.release(request),
                Ok(CommandResult::Reschedule) => {
                    if let Some(key) = key {
                        blocked.insert(key);
                    }
                    remaining.push_back(request);
                }
                Err(e) => {
                    error!(
                        "redispatch {:?} from {} failed: {}",
                        request.packet, request.node, e
                    );
                    let id = request.node;
                    self.cache.release(request);
                    if id != self.node.id() {
                        self.node.remove_node(&peer).await;
                    }
                }
            }
        }
        self.pending = remaining;
    }
}

/// (datatype, session_id, object_id)
type OrderingKey = (u32, u32, u32);

/// 交给对象或用户处理器的报文需要按对象排序，回复报文直接交给等待者
fn ordering_key(packet: &Packet) -> Option<OrderingKey> {
    let datatype = packet.datatype();
    match (datatype, packet.command()) {
        (DATATYPE_OBJECT, CMD_OBJECT_SUBSCRIBE_REPLY)
        | (DATATYPE_MOBJECT, CMD_BARRIER_ENTER_REPLY) => None,
        (DATATYPE_OBJECT, _) | (DATATYPE_MOBJECT, _) | (DATATYPE_USER, _) => {
            Some((datatype, session_id(packet).ok()?, object_id(packet).ok()?))
        }
        _ => None,
    }
}
