use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{lock, network::Packet, node::NodeId};

use super::{Error, Request, RequestCache};

enum Item {
    Request(Request),
    Close,
}

/// 向队列投递请求的句柄，可以被复制到接收任务中
#[derive(Clone)]
pub struct RequestPusher {
    cache: Arc<Mutex<RequestCache>>,
    tx: mpsc::UnboundedSender<Item>,
}

impl RequestPusher {
    /// 复制报文并把 command 加一后入队
    ///
    /// 同一种报文因此有两个命令：刚到达时的 CMD 和延迟处理时的 REQ
    pub fn push(&self, node: NodeId, packet: &Packet) -> Result<(), Error> {
        let mut request = lock(&self.cache).alloc(node, packet);
        let command = request.packet.command().wrapping_add(1);
        request.packet.set_command(command);
        self.tx
            .send(Item::Request(request))
            .map_err(|_| Error::Closed)
    }

    /// 关闭队列，阻塞在 pop 上的任务会收到 Closed
    pub fn close(&self) {
        let _ = self.tx.send(Item::Close);
    }
}

/// 先进先出的请求队列
pub struct RequestQueue {
    cache: Arc<Mutex<RequestCache>>,
    tx: mpsc::UnboundedSender<Item>,
    rx: mpsc::UnboundedReceiver<Item>,
    /// 上一次 pop 出的请求，下一次 pop 时归还缓存
    current: Option<Request>,
    closed: bool,
}

impl RequestQueue {
    pub fn new(cache: Arc<Mutex<RequestCache>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            cache,
            tx,
            rx,
            current: None,
            closed: false,
        }
    }

    pub fn pusher(&self) -> RequestPusher {
        RequestPusher {
            cache: self.cache.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn push(&self, node: NodeId, packet: &Packet) -> Result<(), Error> {
        self.pusher().push(node, packet)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn release_current(&mut self) {
        if let Some(request) = self.current.take() {
            lock(&self.cache).release(request);
        }
    }

    fn accept(&mut self, item: Item) -> Result<(NodeId, &Packet), Error> {
        match item {
            Item::Request(request) => {
                let request = self.current.insert(request);
                Ok((request.node, &request.packet))
            }
            Item::Close => {
                self.closed = true;
                Err(Error::Closed)
            }
        }
    }

    /// 阻塞直到有请求到达，返回的报文在下一次 pop 之前有效
    pub async fn pop(&mut self) -> Result<(NodeId, &Packet), Error> {
        self.release_current();
        if self.closed {
            return Err(Error::Closed);
        }
        match self.rx.recv().await {
            Some(item) => self.accept(item),
            None => Err(Error::Closed),
        }
    }

    pub async fn pop_timeout(&mut self, timeout: Duration) -> Result<(NodeId, &Packet), Error> {
        self.release_current();
        if self.closed {
            return Err(Error::Closed);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => self.accept(item),
            Ok(None) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// 不阻塞，队列为空时返回 None
    pub fn try_pop(&mut self) -> Result<Option<(NodeId, &Packet)>, Error> {
        self.release_current();
        if self.closed {
            return Err(Error::Closed);
        }
        match self.rx.try_recv() {
            Ok(item) => self.accept(item).map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{object::CMD_OBJECT_DELTA, DATATYPE_OBJECT};

    fn queue() -> RequestQueue {
        RequestQueue::new(Arc::new(Mutex::new(RequestCache::default())))
    }

    #[tokio::test]
    async fn push_increments_command() {
        let mut queue = queue();
        let packet = Packet::new(DATATYPE_OBJECT, CMD_OBJECT_DELTA, &[1, 2, 3]);
        queue.push(NodeId(4), &packet).unwrap();

        let (node, popped) = queue.pop().await.unwrap();
        assert_eq!(node, NodeId(4));
        assert_eq!(popped.command(), CMD_OBJECT_DELTA + 1);
        assert_eq!(popped.body(), packet.body());
        // 原报文不受影响
        assert_eq!(packet.command(), CMD_OBJECT_DELTA);
    }

    #[tokio::test]
    async fn fifo_order_with_repeated_pushes() {
        let mut queue = queue();
        for i in 0u8..10 {
            queue
                .push(NodeId(1), &Packet::new(DATATYPE_OBJECT, 7, &[i]))
                .unwrap();
        }
        for i in 0u8..10 {
            let (_, packet) = queue.pop().await.unwrap();
            assert_eq!(packet.command(), 8);
            assert_eq!(packet.body(), &[i]);
        }
        assert!(queue.try_pop().unwrap().is_none());
    }

    #[tokio::test]
    async fn popped_buffers_return_to_cache() {
        let cache = Arc::new(Mutex::new(RequestCache::default()));
        let mut queue = RequestQueue::new(cache.clone());
        queue
            .push(NodeId(1), &Packet::new(DATATYPE_OBJECT, 0, &[0; 4]))
            .unwrap();
        queue
            .push(NodeId(1), &Packet::new(DATATYPE_OBJECT, 0, &[0; 4]))
            .unwrap();
        queue.pop().await.unwrap();
        assert_eq!(cache.lock().unwrap().pooled(), 0);
        queue.pop().await.unwrap();
        assert_eq!(cache.lock().unwrap().pooled(), 1);
    }

    #[tokio::test]
    async fn pusher_from_other_task() {
        let mut queue = queue();
        let pusher = queue.pusher();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher
                .push(NodeId(9), &Packet::new(DATATYPE_OBJECT, 2, &[]))
                .unwrap();
            pusher.close();
        });
        let (node, packet) = queue.pop_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(node, NodeId(9));
        assert_eq!(packet.command(), 3);
        assert!(matches!(queue.pop().await, Err(Error::Closed)));
        assert!(matches!(queue.pop().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn pop_timeout_expires() {
        let mut queue = queue();
        assert!(matches!(
            queue.pop_timeout(Duration::from_millis(10)).await,
            Err(Error::Timeout)
        ));
    }
}
