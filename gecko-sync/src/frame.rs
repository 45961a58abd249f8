//! 分布式模拟的帧数据
//!
//! 主机内存中的位置，速度和颜色数组按照 `[start, end)` 区间划分，
//! 每个区间由一个 DataProxy 负责，FrameData 记录每个代理最新提交的版本
//! 以及它覆盖的区间长度。区间长度之和恰好为 1.0 时才能提交合并后的帧。

use bytes::{BufMut, BytesMut};

use crate::network::packet::{self, read_f32, read_u64};

pub use data::FrameData;
pub use proxy::DataProxy;

pub mod data;
pub mod proxy;

pub const DIRTY_DATA: u64 = 1 << 0;
pub const DIRTY_FLAGS: u64 = 1 << 1;
pub const DIRTY_PROXYDATA: u64 = 1 << 2;
pub const DIRTY_RANGE: u64 = 1 << 3;
pub const DIRTY_ALL: u64 = u64::MAX;

/// 每个物体占 4 个 float
pub const FLOATS_PER_BODY: usize = 4;

fn write_floats(buf: &mut BytesMut, values: &[f32]) {
    buf.put_u64_le(values.len() as u64);
    for value in values {
        buf.put_f32_le(*value);
    }
}

fn read_floats(stream: &mut &[u8]) -> Result<Vec<f32>, packet::Error> {
    let len = read_u64(stream)?;
    let len = usize::try_from(len).map_err(|_| packet::Error::MalformedPacket)?;
    if len.checked_mul(4).map_or(true, |bytes| bytes > stream.len()) {
        return Err(packet::Error::MalformedPacket);
    }
    (0..len).map(|_| read_f32(stream)).collect()
}

/// 区间 `[start, end)` 对应的物体下标
fn body_range(start: f32, end: f32, num_bodies: u32) -> std::ops::Range<usize> {
    let n = num_bodies as f32;
    (start * n) as usize..(end * n) as usize
}

fn valid_range(start: f32, end: f32) -> bool {
    (0.0..=1.0).contains(&start) && (0.0..=1.0).contains(&end) && start < end
}
