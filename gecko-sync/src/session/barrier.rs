use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use crate::{
    lock,
    network::{
        packet::{
            self,
            object::{BarrierPacket, CMD_BARRIER_ENTER, CMD_BARRIER_LEAVE},
        },
        Packet,
    },
    node::{
        self, local::NodeCore, CommandResult, Dispatch, LocalNode, Node, NodeId, PendingRequest,
        Reply, RequestKind,
    },
    request,
};

use super::Error;

/// 屏障
///
/// 主屏障收集进入请求，达到 height 个后同时回复所有等待者
pub struct Barrier {
    id: u32,
    session_id: u32,
    height: u32,
    master: Arc<Node>,
    local: Weak<NodeCore>,
    entered: Mutex<Vec<Entered>>,
}

/// 主屏障记录的一次进入
struct Entered {
    node: Arc<Node>,
    request: BarrierPacket,
    /// 进入者放弃等待的时刻
    deadline: Option<Instant>,
}

impl Entered {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| deadline <= now)
    }
}

impl Barrier {
    pub(crate) fn new(
        id: u32,
        session_id: u32,
        height: u32,
        master: Arc<Node>,
        local: Weak<NodeCore>,
    ) -> Self {
        Self {
            id,
            session_id,
            height,
            master,
            local,
            entered: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 只有主屏障知道高度，映射的屏障为 0
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn master(&self) -> &Arc<Node> {
        &self.master
    }

    /// 进入屏障并等待放行
    ///
    /// 超时后向主屏障撤回本次进入，之后到达的回复被忽略
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let local = LocalNode::upgrade(&self.local).ok_or(Error::LocalNodeStopped)?;
        let requests = &local.core().requests;
        let request_id = requests.register_request(PendingRequest {
            node: self.master.id(),
            kind: RequestKind::Barrier,
        });
        let packet = BarrierPacket::enter(self.session_id, self.id, request_id, timeout);
        if let Err(e) = self.master.send(&packet.to_packet()).await {
            requests.unregister_request(request_id);
            return Err(e.into());
        }

        match requests.wait_request(request_id, timeout).await {
            Ok(Reply::Done) => Ok(()),
            Ok(_) => Err(Error::BarrierFailed(self.id)),
            Err(request::Error::Timeout) => {
                debug!("barrier {} enter {} timed out", self.id, request_id);
                if let Err(e) = self.master.send(&packet.leave().to_packet()).await {
                    warn!("barrier {} leave: {}", self.id, e);
                }
                Err(request::Error::Timeout.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Dispatch for Barrier {
    async fn dispatch(
        &self,
        node: &Arc<Node>,
        packet: &Packet,
    ) -> Result<CommandResult, node::Error> {
        let request = BarrierPacket::read_from(packet)?;
        if request.command == CMD_BARRIER_LEAVE {
            lock(&self.entered).retain(|entered| {
                entered.node.id() != node.id() || entered.request.request_id != request.request_id
            });
            debug!("barrier {}: {} left", self.id, node.id());
            return Ok(CommandResult::Handled);
        }
        if request.command != CMD_BARRIER_ENTER {
            return Err(packet::Error::UnexpectedPacket {
                datatype: packet.datatype(),
                command: request.command,
            }
            .into());
        }

        let now = Instant::now();
        let released = {
            let mut entered = lock(&self.entered);
            // 已经放弃等待的进入者不再计入
            entered.retain(|entered| !entered.expired(now));
            entered.push(Entered {
                node: node.clone(),
                request,
                deadline: request.timeout().map(|timeout| now + timeout),
            });
            debug!(
                "barrier {}: {}/{} entered",
                self.id,
                entered.len(),
                self.height
            );
            if entered.len() < self.height as usize {
                return Ok(CommandResult::Handled);
            }
            std::mem::take(&mut *entered)
        };

        for entered in released {
            let reply = entered.request.reply();
            if let Err(e) = entered.node.send(&reply.to_packet()).await {
                warn!("barrier {} release {}: {}", self.id, entered.node.id(), e);
            }
        }
        Ok(CommandResult::Handled)
    }

    async fn node_disconnected(&self, node: NodeId) {
        lock(&self.entered).retain(|entered| entered.node.id() != node);
    }
}
