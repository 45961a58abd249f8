use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::select_all;
use log::trace;
use tokio::{sync::Notify, time::Instant};

use crate::lock;

use super::conn::{Connection, Readiness};

/// select 的结果，每次只报告一个事件
#[derive(Debug)]
pub enum Event {
    Timeout,
    /// 等待本身出错，是否继续使用由调用方决定
    Error(io::Error),
    /// 监听连接上有新的对端
    Connect(Arc<Connection>),
    /// 连接上有数据可读
    Data(Arc<Connection>),
    /// 对端关闭或连接失效
    Disconnect(Arc<Connection>),
}

type ReadyFuture = Pin<Box<dyn Future<Output = (Arc<Connection>, Readiness)> + Send>>;

/// 多个连接的多路复用
///
/// 连接可以在其他任务中增删，正在 select 的任务会被立即唤醒并重新开始等待，
/// 唤醒本身不作为事件报告
pub struct ConnectionSet<O: Clone> {
    entries: Mutex<Vec<(Arc<Connection>, O)>>,
    wakeup: Notify,
    /// 最近一次报告事件的连接
    selected: Mutex<Option<Arc<Connection>>>,
}

impl<O: Clone> Default for ConnectionSet<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Clone> ConnectionSet<O> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            selected: Mutex::new(None),
        }
    }

    pub fn add_connection(&self, conn: Arc<Connection>, owner: O) {
        lock(&self.entries).push((conn, owner));
        self.wakeup.notify_one();
    }

    /// 连接不存在时返回 false
    pub fn remove_connection(&self, conn: &Arc<Connection>) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            match entries.iter().position(|(c, _)| Arc::ptr_eq(c, conn)) {
                Some(index) => {
                    entries.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            let mut selected = lock(&self.selected);
            if matches!(selected.as_ref(), Some(c) if Arc::ptr_eq(c, conn)) {
                selected.take();
            }
            drop(selected);
            self.wakeup.notify_one();
        }
        removed
    }

    /// 连接关联的所有者
    pub fn owner(&self, conn: &Arc<Connection>) -> Option<O> {
        lock(&self.entries)
            .iter()
            .find(|(c, _)| Arc::ptr_eq(c, conn))
            .map(|(_, owner)| owner.clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.entries).iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
        lock(&self.selected).take();
        self.wakeup.notify_one();
    }

    pub fn selected(&self) -> Option<Arc<Connection>> {
        lock(&self.selected).clone()
    }

    /// 等待任意一个连接就绪，timeout 为 None 时无限等待
    pub async fn select(&self, timeout: Option<Duration>) -> Event {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let snapshot = self.connections();
            let waits: Vec<ReadyFuture> = snapshot
                .into_iter()
                .map(|conn| {
                    Box::pin(async move {
                        let readiness = conn.poll_ready().await;
                        (conn, readiness)
                    }) as ReadyFuture
                })
                .collect();

            let ready = async {
                if waits.is_empty() {
                    futures::future::pending().await
                } else {
                    select_all(waits).await.0
                }
            };
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            };

            let (conn, readiness) = tokio::select! {
                res = ready => res,
                _ = self.wakeup.notified() => {
                    trace!("connection set changed, restart select");
                    continue;
                }
                _ = expired => return Event::Timeout,
            };

            // 等待期间已被移除
            if !lock(&self.entries).iter().any(|(c, _)| Arc::ptr_eq(c, &conn)) {
                continue;
            }
            *lock(&self.selected) = Some(conn.clone());
            return match readiness {
                Readiness::Connect => Event::Connect(conn),
                Readiness::Data => Event::Data(conn),
                Readiness::Disconnect => Event::Disconnect(conn),
                Readiness::Error(e) => Event::Error(e),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn empty_set_times_out() {
        let set = ConnectionSet::<u32>::new();
        assert!(matches!(
            set.select(Some(Duration::from_millis(10))).await,
            Event::Timeout
        ));
    }

    #[tokio::test]
    async fn reports_data_with_owner() {
        let set = ConnectionSet::new();
        let idle = Arc::new(Connection::pipe());
        let busy = Arc::new(Connection::pipe());
        set.add_connection(idle.clone(), 1u32);
        set.add_connection(busy.clone(), 2u32);

        busy.send(b"x").await.unwrap();
        match set.select(Some(Duration::from_secs(1))).await {
            Event::Data(conn) => {
                assert!(Arc::ptr_eq(&conn, &busy));
                assert_eq!(set.owner(&conn), Some(2));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(set.selected().is_some());
        assert!(set.remove_connection(&busy));
        assert!(set.selected().is_none());
        assert!(!set.remove_connection(&busy));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_wakes_blocked_select() {
        let set = Arc::new(ConnectionSet::new());
        let waiter = tokio::spawn({
            let set = set.clone();
            async move { set.select(None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let conn = Arc::new(Connection::pipe());
        conn.send(b"wake").await.unwrap();
        set.add_connection(conn.clone(), 7u32);

        let event = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("select was not woken")
            .unwrap();
        assert!(matches!(event, Event::Data(c) if Arc::ptr_eq(&c, &conn)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_wakes_blocked_select() {
        let set = Arc::new(ConnectionSet::new());
        let removed = Arc::new(Connection::pipe());
        set.add_connection(removed.clone(), 1u32);

        let waiter = tokio::spawn({
            let set = set.clone();
            async move { set.select(Some(Duration::from_millis(300))).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        set.remove_connection(&removed);
        // 被移除的连接上的数据不会被报告
        removed.send(b"late").await.unwrap();

        let event = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(event, Event::Timeout));
    }

    #[tokio::test]
    async fn closed_connection_reports_disconnect() {
        let set = ConnectionSet::new();
        let conn = Arc::new(Connection::pipe());
        set.add_connection(conn.clone(), ());
        conn.close();
        assert!(matches!(
            set.select(Some(Duration::from_secs(1))).await,
            Event::Disconnect(_)
        ));
    }
}
