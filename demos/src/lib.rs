use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};
use gecko_sync::{
    frame::{DataProxy, FrameData, FLOATS_PER_BODY},
    Config,
};

/// 主节点在会话中第一个注册的对象，客户端据此映射帧数据
pub const FRAME_ID: u32 = 1;
pub const SESSION_NAME: &str = "nbody";

/// 环境变量覆盖项，前缀 `GECKO_SYNC_`
#[derive(Debug, Default, serde::Deserialize)]
pub struct EnvOverrides {
    pub listen: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub launch_timeout_ms: Option<u64>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("GECKO_SYNC_").from_env::<Self>()
    }

    pub fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.node.listen = Some(listen);
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.node.request_timeout_ms = timeout;
        }
        if let Some(timeout) = self.launch_timeout_ms {
            config.node.launch_timeout_ms = timeout;
        }
    }
}

/// 日志级别来自 RUST_LOG，默认 info
pub fn init_logger() -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str("info")?.start()
}

/// 被启动的客户端可能和主节点在同一台主机上，保留主机只让系统分配端口
pub fn use_ephemeral_port(config: &mut Config) {
    let host = match config.node.listen.as_deref() {
        Some(listen) => listen
            .rsplit_once(':')
            .map_or(listen, |(host, _)| host)
            .to_string(),
        None => "0.0.0.0".to_string(),
    };
    config.node.listen = Some(format!("{}:0", host));
}

/// 配置文件不存在时使用默认配置
pub async fn load_config(path: &str) -> Result<Config, gecko_sync::config::Error> {
    match Config::from_path(path).await {
        Err(gecko_sync::config::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("{} not found, using defaults", path);
            Ok(Config::default())
        }
        res => res,
    }
}

/// 把物体均匀地摆在一个圆盘上，初速度沿切线方向
pub fn init_bodies(frame: &mut FrameData) {
    let n = frame.num_bodies().max(1) as f32;
    let scale = frame.cluster_scale();
    let speed = frame.velocity_scale();

    let positions: Vec<f32> = (0..frame.num_bodies())
        .flat_map(|i| {
            let angle = i as f32 / n * std::f32::consts::TAU;
            [angle.cos() * scale, angle.sin() * scale, 0.0, 1.0]
        })
        .collect();
    let velocities: Vec<f32> = (0..frame.num_bodies())
        .flat_map(|i| {
            let angle = i as f32 / n * std::f32::consts::TAU;
            [-angle.sin() * speed, angle.cos() * speed, 0.0, 0.0]
        })
        .collect();

    frame.positions_mut().copy_from_slice(&positions);
    frame.velocities_mut().copy_from_slice(&velocities);
    for (i, color) in frame
        .colors_mut()
        .chunks_exact_mut(FLOATS_PER_BODY)
        .enumerate()
    {
        color.copy_from_slice(&[i as f32 / n, 0.5, 1.0 - i as f32 / n, 1.0]);
    }
}

/// 在代理负责的分区内推进一步
pub fn step(proxy: &mut DataProxy, delta_time: f32) {
    let velocities = proxy.velocities().to_vec();
    for (position, velocity) in proxy.positions_mut().iter_mut().zip(velocities) {
        *position += velocity * delta_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gecko_sync::Version;

    #[test]
    fn step_moves_partition() {
        let mut frame = FrameData::new();
        frame.init(4);
        frame.init_host_data();
        frame.update_parameters(1.0, 1.0, 0.5);
        init_bodies(&mut frame);
        frame.add_proxy_id(1, 0.0, 1.0).unwrap();

        let mut proxy = DataProxy::new(1, 0.0, 1.0, 4).unwrap();
        assert!(proxy.init_from(&frame));
        step(&mut proxy, frame.delta_time());
        assert!(frame.update_from_proxy(&proxy, Version(2)));

        // 第一个物体在 (1, 0)，速度 (0, 1)
        assert_eq!(&frame.positions()[..2], &[1.0, 0.5]);
        assert!(frame.is_ready());
    }

    #[test]
    fn overrides_replace_config() {
        let mut config = Config::default();
        EnvOverrides {
            listen: Some("127.0.0.1:5000".to_string()),
            request_timeout_ms: Some(100),
            launch_timeout_ms: None,
        }
        .apply(&mut config);
        assert_eq!(config.node.listen.as_deref(), Some("127.0.0.1:5000"));
        assert_eq!(config.node.request_timeout_ms, 100);
        assert_eq!(config.node.launch_timeout_ms, 10_000);
    }

    #[test]
    fn launched_client_port_is_ephemeral() {
        let mut config = Config::default();
        config.node.listen = Some("127.0.0.1:4242".to_string());
        use_ephemeral_port(&mut config);
        assert_eq!(config.node.listen.as_deref(), Some("127.0.0.1:0"));

        config.node.listen = Some("render1".to_string());
        use_ephemeral_port(&mut config);
        assert_eq!(config.node.listen.as_deref(), Some("render1:0"));

        config.node.listen = None;
        use_ephemeral_port(&mut config);
        assert_eq!(config.node.listen.as_deref(), Some("0.0.0.0:0"));
    }
}
