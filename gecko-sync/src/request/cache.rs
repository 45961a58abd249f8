use bytes::BytesMut;

use crate::{network::Packet, node::NodeId};

/// 小于等于此长度的报文使用缓存池中的缓冲区
pub const DEFAULT_SMALL_PACKET_SIZE: usize = 256;
pub const DEFAULT_MAX_POOLED: usize = 64;

/// 一个待处理的请求：来源节点和报文的副本
#[derive(Debug, Clone)]
pub struct Request {
    pub node: NodeId,
    pub packet: Packet,
}

/// 请求缓存，复用小报文的缓冲区，避免热路径上频繁分配
#[derive(Debug)]
pub struct RequestCache {
    free: Vec<BytesMut>,
    small_size: usize,
    max_free: usize,
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(DEFAULT_SMALL_PACKET_SIZE, DEFAULT_MAX_POOLED)
    }
}

impl RequestCache {
    pub fn new(small_size: usize, max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            small_size,
            max_free,
        }
    }

    /// 复制报文，得到一个新的请求
    pub fn alloc(&mut self, node: NodeId, packet: &Packet) -> Request {
        let buf = if packet.len() <= self.small_size {
            self.free
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(self.small_size))
        } else {
            BytesMut::with_capacity(packet.len())
        };
        Request {
            node,
            packet: packet.copy_into(buf),
        }
    }

    /// 归还请求，大报文的缓冲区直接释放
    pub fn release(&mut self, request: Request) {
        if request.packet.len() > self.small_size || self.free.len() >= self.max_free {
            return;
        }
        let mut buf = request.packet.into_inner();
        buf.clear();
        self.free.push(buf);
    }

    /// 缓存池中空闲缓冲区的数量
    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}
