use std::time::Duration;

use tokio::{fs, io::AsyncReadExt};

use crate::{
    network::{self, packet::DEFAULT_MAX_PACKET_SIZE, ConnectionDescription},
    request::cache::{DEFAULT_MAX_POOLED, DEFAULT_SMALL_PACKET_SIZE},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub request: RequestConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 监听地址，`<host>[:<port>]`
    pub listen: Option<String>,
    /// 等待远程启动的节点回连
    pub launch_timeout_ms: u64,
    /// 新连接发送握手报文的时限
    pub handshake_timeout_ms: u64,
    /// 会话映射，订阅等阻塞请求的时限
    pub request_timeout_ms: u64,
    pub max_packet_size: u64,
    /// 等待重新派发的报文数上限，超出后断开来源节点
    pub max_pending_packets: usize,
    pub redispatch_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: None,
            launch_timeout_ms: 10_000,
            handshake_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_pending_packets: 4096,
            redispatch_interval_ms: 10,
        }
    }
}

impl NodeConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn redispatch_interval(&self) -> Duration {
        Duration::from_millis(self.redispatch_interval_ms)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub small_packet_size: usize,
    pub max_pooled: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            small_packet_size: DEFAULT_SMALL_PACKET_SIZE,
            max_pooled: DEFAULT_MAX_POOLED,
        }
    }
}

/// 预先配置的对端节点
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PeerConfig {
    pub address: String,
    /// 启动模板，`%h` 替换为主机名，`%c` 替换为远程命令
    ///
    /// 远程命令是单引号包起来的一个词，模板必须交给会重新分词的 shell
    /// 执行，例如 `ssh -n %h %c`
    #[serde(default)]
    pub launch_command: Option<String>,
    #[serde(default)]
    pub launch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub auto_launch: bool,
}

impl PeerConfig {
    pub fn description(&self, node: &NodeConfig) -> Result<ConnectionDescription, network::Error> {
        let mut desc = self.address.parse::<ConnectionDescription>()?;
        desc.launch_command = self.launch_command.clone();
        desc.launch_timeout = self
            .launch_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| node.launch_timeout());
        Ok(desc)
    }
}

impl Config {
    pub async fn from_path(path: &str) -> Result<Self, Error> {
        let mut file = fs::File::open(path).await?;
        let mut s = String::new();
        file.read_to_string(&mut s).await?;

        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }
}
