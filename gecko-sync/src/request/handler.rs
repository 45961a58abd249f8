use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::sync::oneshot;

use crate::{lock, network::packet::INVALID_ID};

use super::Error;

struct Entry<D, R> {
    data: D,
    tx: Option<oneshot::Sender<R>>,
    rx: Option<oneshot::Receiver<R>>,
}

struct Inner<D, R> {
    next_id: u32,
    requests: HashMap<u32, Entry<D, R>>,
}

/// 把异步到达的回复和发起请求的调用方关联起来
///
/// 调用方注册请求得到 id，把 id 放进报文发出后阻塞在 wait_request 上，
/// 接收任务收到回复后用 serve_request 唤醒调用方
pub struct RequestHandler<D, R> {
    inner: Mutex<Inner<D, R>>,
}

impl<D: Clone, R> Default for RequestHandler<D, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Clone, R> RequestHandler<D, R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                requests: HashMap::new(),
            }),
        }
    }

    /// 注册请求，data 在回复到达时用于恢复上下文
    pub fn register_request(&self, data: D) -> u32 {
        let mut inner = lock(&self.inner);
        let mut id = inner.next_id;
        while id == INVALID_ID || inner.requests.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        inner.requests.insert(
            id,
            Entry {
                data,
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        id
    }

    pub fn request_data(&self, id: u32) -> Option<D> {
        lock(&self.inner)
            .requests
            .get(&id)
            .map(|entry| entry.data.clone())
    }

    /// 交付结果，唤醒等待者。结果会保留到 wait_request 取走
    pub fn serve_request(&self, id: u32, result: R) -> Result<(), Error> {
        let tx = lock(&self.inner)
            .requests
            .get_mut(&id)
            .and_then(|entry| entry.tx.take())
            .ok_or(Error::UnknownRequest(id))?;
        // 等待者已超时退出
        let _ = tx.send(result);
        Ok(())
    }

    /// 注销请求，正在等待的调用方会收到 Cancelled
    pub fn unregister_request(&self, id: u32) -> bool {
        lock(&self.inner).requests.remove(&id).is_some()
    }

    /// 注销所有不满足条件的请求
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&D) -> bool,
    {
        lock(&self.inner).requests.retain(|_, entry| f(&entry.data));
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).requests.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).requests.is_empty()
    }

    /// 等待请求被服务，超时后请求被注销
    pub async fn wait_request(&self, id: u32, timeout: Option<Duration>) -> Result<R, Error> {
        let rx = lock(&self.inner)
            .requests
            .get_mut(&id)
            .ok_or(Error::UnknownRequest(id))?
            .rx
            .take()
            .ok_or(Error::AlreadyWaiting(id))?;

        let res = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(res) => res.map_err(|_| Error::Cancelled(id)),
                Err(_) => Err(Error::Timeout),
            },
            None => rx.await.map_err(|_| Error::Cancelled(id)),
        };
        self.unregister_request(id);
        res
    }
}
