//! 分布式对象层
//!
//! 每个对象有且只有一个主对象，主对象 commit 时打包增量并发送给所有从对象。
//! 从对象把收到的数据放入自己的队列，sync 时按版本顺序应用。

use bytes::BytesMut;

use crate::{
    network::packet,
    node, request, session,
};

pub use master::MasterObject;
pub use slave::SlaveObject;
pub use version::Version;

pub mod master;
pub mod slave;
pub mod version;

/// 可以被复制的数据
///
/// 订阅时发送完整的实例数据，之后每次提交发送增量。
/// 增量默认就是完整的实例数据。
pub trait Distributed: Send + Sync + 'static {
    /// 写入完整的实例数据
    fn get_instance_data(&self, buf: &mut BytesMut);

    fn apply_instance_data(&mut self, data: &mut &[u8]) -> Result<(), packet::Error>;

    /// 写入自上次提交以来的增量
    fn pack(&self, buf: &mut BytesMut) {
        self.get_instance_data(buf)
    }

    fn unpack(&mut self, data: &mut &[u8]) -> Result<(), packet::Error> {
        self.apply_instance_data(data)
    }

    /// 提交完成后调用，用于清除脏标记
    fn committed(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Node error: {0}")]
    Node(#[from] node::Error),
    #[error("Session error: {0}")]
    Session(#[from] session::Error),
    #[error("Request error: {0}")]
    Request(#[from] request::Error),
    #[error("Decode object data: {0}")]
    Decode(#[from] packet::Error),
    #[error("Version gap: expected {expected}, received {actual}")]
    VersionGap { expected: Version, actual: Version },
    #[error("Master disconnected")]
    MasterDisconnected,
    #[error("Sync timeout")]
    Timeout,
    #[error("Master object is on the local node")]
    MapOnMaster,
    #[error("Object {0} not found on master")]
    NotFound(u32),
    #[error("Invalid proxy range [{start}, {end})")]
    InvalidRange { start: f32, end: f32 },
    #[error("Too many proxies, maximum {0}")]
    TooManyProxies(usize),
}
