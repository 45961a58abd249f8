use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::time::Instant;

use crate::{
    network::{
        packet::{
            self,
            object::{
                data_version, ObjectDataPacket, ObjectSubscribePacket, ObjectUnsubscribePacket,
                CMD_OBJECT_DELTA, CMD_OBJECT_INSTANCE,
            },
        },
        Packet,
    },
    node::{self, CommandResult, Dispatch, Node, NodeId, PendingRequest, Reply, RequestKind},
    request::{self, RequestCache, RequestPusher, RequestQueue},
    session::Session,
};

use super::{Distributed, Error, Version};

/// 从对象
///
/// 接收任务把主对象发来的数据放入队列，sync 时按顺序应用。
/// 版本不比当前新的数据会被丢弃。
pub struct SlaveObject<T> {
    id: u32,
    session: Arc<Session>,
    master: Arc<Node>,
    data: T,
    version: Version,
    queue: RequestQueue,
    /// 已收到的最新版本
    received: Arc<AtomicU32>,
}

impl<T: Distributed> SlaveObject<T> {
    pub(crate) async fn map(
        session: &Arc<Session>,
        id: u32,
        master: &Arc<Node>,
        data: T,
    ) -> Result<Self, Error> {
        let local = session.local_node()?;
        if master.id() == local.id() {
            return Err(Error::MapOnMaster);
        }

        let config = &local.config().request;
        let cache = RequestCache::new(config.small_packet_size, config.max_pooled);
        let queue = RequestQueue::new(Arc::new(Mutex::new(cache)));
        let received = Arc::new(AtomicU32::new(Version::NONE.0));
        session.register_object(
            id,
            Arc::new(SlaveHandler {
                id,
                master: master.id(),
                pusher: queue.pusher(),
                received: received.clone(),
            }),
        );

        let requests = &local.core().requests;
        let request_id = requests.register_request(PendingRequest {
            node: master.id(),
            kind: RequestKind::Subscribe,
        });
        let subscribe = ObjectSubscribePacket {
            session_id: session.id(),
            object_id: id,
            request_id,
        };
        if let Err(e) = master.send(&subscribe.to_packet()).await {
            requests.unregister_request(request_id);
            session.deregister_object(id);
            return Err(e.into());
        }

        let timeout = local.config().node.request_timeout();
        let version = match requests.wait_request(request_id, Some(timeout)).await {
            Ok(Reply::Subscribed { version }) => Version(version),
            Ok(_) => {
                session.deregister_object(id);
                return Err(Error::NotFound(id));
            }
            Err(e) => {
                session.deregister_object(id);
                return Err(e.into());
            }
        };

        let mut slave = Self {
            id,
            session: session.clone(),
            master: master.clone(),
            data,
            version: Version::NONE,
            queue,
            received,
        };
        // 实例数据在回复之前到达，已经在队列中
        slave.sync(version, Some(timeout)).await?;
        Ok(slave)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn master(&self) -> &Arc<Node> {
        &self.master
    }

    /// 已应用的版本
    pub fn version(&self) -> Version {
        self.version
    }

    /// 已收到但可能尚未应用的最新版本
    pub fn head_version(&self) -> Version {
        Version(self.received.load(Ordering::Acquire))
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// 同步到指定版本
    ///
    /// 版本不比当前新时立即返回，不消费队列中的数据
    pub async fn sync(&mut self, version: Version, timeout: Option<Duration>) -> Result<Version, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while version.is_newer_than(self.version) {
            let data = {
                let popped = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        self.queue.pop_timeout(remaining).await
                    }
                    None => self.queue.pop().await,
                };
                let (_, packet) = popped.map_err(queue_error)?;
                ObjectDataPacket::read_from(packet)?
            };
            self.apply(data)?;
        }
        Ok(self.version)
    }

    /// 应用队列中已经收到的所有数据，不等待
    pub fn sync_head(&mut self) -> Result<Version, Error> {
        loop {
            let data = match self.queue.try_pop() {
                Ok(Some((_, packet))) => ObjectDataPacket::read_from(packet)?,
                Ok(None) | Err(request::Error::Closed) => break,
                Err(e) => return Err(e.into()),
            };
            self.apply(data)?;
        }
        Ok(self.version)
    }

    fn apply(&mut self, packet: ObjectDataPacket) -> Result<(), Error> {
        let version = Version(packet.version);
        if !version.is_newer_than(self.version) {
            debug!("object {} skip stale {}", self.id, version);
            return Ok(());
        }

        let mut stream = packet.data.as_slice();
        if packet.is_instance() {
            self.data.apply_instance_data(&mut stream)?;
        } else {
            let expected = self.version.next();
            if version != expected {
                return Err(Error::VersionGap {
                    expected,
                    actual: version,
                });
            }
            self.data.unpack(&mut stream)?;
        }
        trace!("object {} applied {}", self.id, version);
        self.version = version;
        Ok(())
    }

    /// 取消订阅并注销
    pub async fn unmap(self) -> Result<(), Error> {
        let unsubscribe = ObjectUnsubscribePacket {
            session_id: self.session.id(),
            object_id: self.id,
        };
        self.session.deregister_object(self.id);
        if self.master.is_connected() {
            self.master.send(&unsubscribe.to_packet()).await?;
        }
        Ok(())
    }
}

impl<T> Drop for SlaveObject<T> {
    fn drop(&mut self) {
        self.session.deregister_object(self.id);
    }
}

fn queue_error(e: request::Error) -> Error {
    match e {
        request::Error::Closed => Error::MasterDisconnected,
        request::Error::Timeout => Error::Timeout,
        e => Error::Request(e),
    }
}

struct SlaveHandler {
    id: u32,
    master: NodeId,
    pusher: RequestPusher,
    received: Arc<AtomicU32>,
}

#[async_trait]
impl Dispatch for SlaveHandler {
    async fn dispatch(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, node::Error> {
        let command = packet.command();
        if node.id() != self.master || (command != CMD_OBJECT_INSTANCE && command != CMD_OBJECT_DELTA) {
            return Err(packet::Error::UnexpectedPacket {
                datatype: packet.datatype(),
                command,
            }
            .into());
        }

        let version = Version(data_version(packet)?);
        let head = Version(self.received.load(Ordering::Acquire));
        if !version.is_newer_than(head) {
            debug!("object {} drop stale {} (head {})", self.id, version, head);
            return Ok(CommandResult::Handled);
        }
        self.received.store(version.0, Ordering::Release);
        if self.pusher.push(node.id(), packet).is_err() {
            warn!("object {} queue closed", self.id);
        }
        Ok(CommandResult::Handled)
    }

    async fn node_disconnected(&self, node: NodeId) {
        if node == self.master {
            self.pusher.close();
        }
    }
}
