use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    network::{
        packet::{
            self,
            object::{
                ObjectDataPacket, ObjectSubscribePacket, ObjectSubscribeReplyPacket,
                ObjectUnsubscribePacket, CMD_OBJECT_DELTA, CMD_OBJECT_INSTANCE,
                CMD_OBJECT_SUBSCRIBE, CMD_OBJECT_UNSUBSCRIBE,
            },
        },
        Packet,
    },
    node::{self, CommandResult, Dispatch, Node, NodeId},
    session::Session,
};

use super::{Distributed, Error, Version};

struct MasterState<T> {
    data: T,
    version: Version,
    slaves: Vec<Arc<Node>>,
}

impl<T: Distributed> MasterState<T> {
    fn data_packet(&self, command: u32, session_id: u32, object_id: u32) -> Packet {
        let mut buf = BytesMut::new();
        if command == CMD_OBJECT_INSTANCE {
            self.data.get_instance_data(&mut buf);
        } else {
            self.data.pack(&mut buf);
        }
        ObjectDataPacket {
            command,
            session_id,
            object_id,
            version: self.version.0,
            data: buf.to_vec(),
        }
        .to_packet()
    }
}

/// 主对象
///
/// 唯一可以提交的实例。初始数据的版本为 Version::FIRST，每次提交加一。
pub struct MasterObject<T> {
    id: u32,
    session: Arc<Session>,
    state: Arc<Mutex<MasterState<T>>>,
}

impl<T: Distributed> MasterObject<T> {
    pub(crate) async fn register(session: &Arc<Session>, data: T) -> Result<Arc<Self>, Error> {
        let id = session.gen_ids(1).await?;
        let state = Arc::new(Mutex::new(MasterState {
            data,
            version: Version::FIRST,
            slaves: Vec::new(),
        }));
        session.register_object(
            id,
            Arc::new(MasterHandler {
                id,
                session_id: session.id(),
                state: state.clone(),
            }),
        );
        info!("registered master object {} in session {}", id, session.id());
        Ok(Arc::new(Self {
            id,
            session: session.clone(),
            state,
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn version(&self) -> Version {
        self.state.lock().await.version
    }

    pub async fn slave_count(&self) -> usize {
        self.state.lock().await.slaves.len()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock().await.data)
    }

    /// 修改数据，修改在下一次 commit 时发送
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.state.lock().await.data)
    }

    /// 提交新版本，把增量发送给所有从对象
    ///
    /// 发送失败的从对象被移除
    pub async fn commit(&self) -> Version {
        let mut state = self.state.lock().await;
        state.version = state.version.next();
        let packet = state.data_packet(CMD_OBJECT_DELTA, self.session.id(), self.id);

        let slaves = std::mem::take(&mut state.slaves);
        for slave in slaves {
            match slave.send(&packet).await {
                Ok(()) => state.slaves.push(slave),
                Err(e) => warn!("object {} drop slave {}: {}", self.id, slave.id(), e),
            }
        }
        state.data.committed();
        debug!(
            "object {} committed {} to {} slaves",
            self.id,
            state.version,
            state.slaves.len()
        );
        state.version
    }

    /// 注销主对象，之后的订阅请求会失败
    pub fn deregister(&self) {
        self.session.deregister_object(self.id);
    }
}

struct MasterHandler<T> {
    id: u32,
    session_id: u32,
    state: Arc<Mutex<MasterState<T>>>,
}

#[async_trait]
impl<T: Distributed> Dispatch for MasterHandler<T> {
    async fn dispatch(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, node::Error> {
        // 正在提交时稍后再处理，不阻塞接收任务
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(_) => return Ok(CommandResult::Reschedule),
        };

        match packet.command() {
            CMD_OBJECT_SUBSCRIBE => {
                let request = ObjectSubscribePacket::read_from(packet)?;
                let instance = state.data_packet(CMD_OBJECT_INSTANCE, self.session_id, self.id);
                node.send(&instance).await?;
                if !state.slaves.iter().any(|slave| slave.id() == node.id()) {
                    state.slaves.push(node.clone());
                }
                let reply = ObjectSubscribeReplyPacket {
                    session_id: self.session_id,
                    object_id: self.id,
                    request_id: request.request_id,
                    result: true,
                    version: state.version.0,
                };
                node.send(&reply.to_packet()).await?;
                info!(
                    "{} subscribed object {} at {}",
                    node.id(),
                    self.id,
                    state.version
                );
            }
            CMD_OBJECT_UNSUBSCRIBE => {
                ObjectUnsubscribePacket::read_from(packet)?;
                state.slaves.retain(|slave| slave.id() != node.id());
                debug!("{} unsubscribed object {}", node.id(), self.id);
            }
            command => {
                return Err(packet::Error::UnexpectedPacket {
                    datatype: packet.datatype(),
                    command,
                }
                .into())
            }
        }
        Ok(CommandResult::Handled)
    }

    async fn node_disconnected(&self, node: NodeId) {
        self.state
            .lock()
            .await
            .slaves
            .retain(|slave| slave.id() != node);
    }
}
