use std::time::Duration;

use clap::Parser;
use demos::{
    init_bodies, init_logger, load_config, step, use_ephemeral_port, EnvOverrides, FRAME_ID,
    SESSION_NAME,
};
use gecko_sync::{
    frame::{DataProxy, FrameData},
    network::Protocol,
    object, Context, LocalNode,
};
use log::{info, warn};

#[derive(Debug, Parser)]
#[clap(author, version, about = "n 体模拟的帧数据同步")]
struct Args {
    /// 配置文件
    #[clap(long, default_value = "./standalone.toml")]
    config: String,
    /// 覆盖配置中的监听地址
    #[clap(long)]
    listen: Option<String>,
    /// 作为集群节点监听，由启动者传入
    #[clap(long)]
    sync_listen: bool,
    /// 回连启动者，`<request_id>:<address>`
    #[clap(long)]
    sync_client: Option<String>,
    #[clap(long, default_value_t = 1024)]
    bodies: u32,
    #[clap(long, default_value_t = 100)]
    frames: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _logger = init_logger()?;
    let args = Args::parse();

    // 获取配置
    let mut config = load_config(&args.config).await?;
    match EnvOverrides::from_env() {
        Ok(overrides) => overrides.apply(&mut config),
        Err(e) => warn!("ignore environment overrides: {}", e),
    }
    match args.listen.clone() {
        Some(listen) => config.node.listen = Some(listen),
        // 配置中的固定端口留给主节点
        None if args.sync_client.is_some() => use_ephemeral_port(&mut config),
        None => {}
    }

    let node = LocalNode::new(Context::from_env(), config);
    match args.sync_client.as_deref() {
        Some(arg) => run_client(node, arg, args.sync_listen).await?,
        None => run_master(node, &args).await?,
    }
    Ok(())
}

async fn run_master(node: LocalNode, args: &Args) -> Result<(), gecko_sync::Error> {
    node.listen(None).await?;
    let session = node.map_session(&node.self_node()?, SESSION_NAME).await?;

    let mut frame = FrameData::new();
    frame.init(args.bodies);
    frame.init_host_data();
    frame.update_parameters(1.54, 8.0, 0.016);
    init_bodies(&mut frame);
    frame.add_proxy_id(FRAME_ID, 0.0, 1.0)?;
    let master = session.register_master(frame).await?;
    info!("frame data {} registered", master.id());

    // 对象注册后再启动渲染节点，保证客户端可以映射
    let network = session.add_network(Protocol::Tcp);
    for peer in node.create_peer_nodes()? {
        network.add_node(peer)?;
    }
    session.init();
    session.start().await?;

    let mut proxy = DataProxy::new(FRAME_ID, 0.0, 1.0, args.bodies)?;
    let mut version = master.version().await;
    for _ in 0..args.frames {
        let delta_time = master
            .read(|frame| {
                proxy.init_from(frame);
                frame.delta_time()
            })
            .await;
        step(&mut proxy, delta_time);
        master
            .update(|frame| frame.update_from_proxy(&proxy, version.next()))
            .await;
        version = master.commit().await;
        tokio::time::sleep(Duration::from_millis(16)).await;
    }
    info!("{} frames committed, last {}", args.frames, version);

    session.exit().await;
    node.stop_listening().await?;
    Ok(())
}

async fn run_client(node: LocalNode, arg: &str, listen: bool) -> Result<(), gecko_sync::Error> {
    if listen {
        node.listen(None).await?;
    }
    let server = node.run_client(arg).await?;
    let session = node.map_session(&server, SESSION_NAME).await?;
    let mut frame = session
        .map_object(FRAME_ID, &server, FrameData::new())
        .await?;
    info!(
        "mapped frame data {} bodies at {}",
        frame.data().num_bodies(),
        frame.version()
    );

    loop {
        match frame.sync(frame.version().next(), None).await {
            Ok(version) => info!("frame {} ready: {}", version, frame.data().is_ready()),
            Err(object::Error::MasterDisconnected) => {
                info!("launcher disconnected");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    node.stop_listening().await?;
    Ok(())
}
