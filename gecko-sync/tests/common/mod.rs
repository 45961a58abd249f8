#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use gecko_sync::{
    network::{
        packet::{self, read_u32},
        Connection, ConnectionDescription,
    },
    Config, Context, Distributed, Hook, LocalNode, MessageType, Node, NodeId,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn config() -> Config {
    let mut config = Config::default();
    config.node.request_timeout_ms = 5000;
    config
}

pub async fn listening_node() -> LocalNode {
    listening_node_with_hook(Arc::new(gecko_sync::HookNoop)).await
}

pub async fn listening_node_with_hook(hook: Arc<dyn Hook>) -> LocalNode {
    listening_node_with(config(), hook).await
}

pub async fn listening_node_with(config: Config, hook: Arc<dyn Hook>) -> LocalNode {
    let node = LocalNode::with_hook(Context::new("gecko-sync-test"), config, hook);
    let listener = Connection::new(ConnectionDescription::tcp("127.0.0.1", 0));
    node.listen(Some(listener)).await.unwrap();
    node
}

pub fn address(node: &LocalNode) -> ConnectionDescription {
    node.listener().unwrap().description()
}

/// 本地节点 from 连接 to，返回 to 在 from 中的代理
pub async fn connect(from: &LocalNode, to: &LocalNode) -> Arc<Node> {
    let proxy = from.create_node();
    proxy.add_description(address(to));
    from.connect_node(&proxy).await.unwrap();
    proxy
}

/// 一个未被监听的本地端口
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Counter(pub u32);

impl Distributed for Counter {
    fn get_instance_data(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.0);
    }

    fn apply_instance_data(&mut self, data: &mut &[u8]) -> Result<(), packet::Error> {
        self.0 = read_u32(data)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Connected(NodeId),
    Disconnected(NodeId),
    Message(NodeId, MessageType, Vec<u8>),
}

#[derive(Default)]
pub struct RecordingHook {
    pub events: Mutex<Vec<HookEvent>>,
}

impl RecordingHook {
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Hook for RecordingHook {
    async fn connected(&self, node: NodeId) {
        self.events.lock().unwrap().push(HookEvent::Connected(node));
    }

    async fn disconnected(&self, node: NodeId) {
        self.events.lock().unwrap().push(HookEvent::Disconnected(node));
    }

    async fn message(&self, node: NodeId, kind: MessageType, data: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push(HookEvent::Message(node, kind, data.to_vec()));
    }
}
