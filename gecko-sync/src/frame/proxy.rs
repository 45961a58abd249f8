use std::ops::Range;

use bytes::{BufMut, BytesMut};

use crate::{
    network::packet::{self, read_f32, read_u32, read_u64},
    object::{self, Distributed},
};

use super::{
    body_range, read_floats, valid_range, write_floats, FrameData, DIRTY_ALL, DIRTY_DATA,
    DIRTY_RANGE, FLOATS_PER_BODY,
};

/// 负责 `[start, end)` 区间的数据代理，只序列化自己的分区
#[derive(Debug, Clone, PartialEq)]
pub struct DataProxy {
    id: u32,
    start: f32,
    end: f32,
    num_bodies: u32,
    positions: Vec<f32>,
    velocities: Vec<f32>,
    colors: Vec<f32>,
    dirty: u64,
}

impl DataProxy {
    pub fn new(id: u32, start: f32, end: f32, num_bodies: u32) -> Result<Self, object::Error> {
        if !valid_range(start, end) {
            return Err(object::Error::InvalidRange { start, end });
        }
        let len = body_range(start, end, num_bodies).len() * FLOATS_PER_BODY;
        Ok(Self {
            id,
            start,
            end,
            num_bodies,
            positions: vec![0.0; len],
            velocities: vec![0.0; len],
            colors: vec![0.0; len],
            dirty: DIRTY_ALL,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn range(&self) -> (f32, f32) {
        (self.start, self.end)
    }

    pub fn num_bodies(&self) -> u32 {
        self.num_bodies
    }

    /// 分区在整个数组中的 float 下标
    pub fn float_range(&self) -> Range<usize> {
        let bodies = body_range(self.start, self.end, self.num_bodies);
        bodies.start * FLOATS_PER_BODY..bodies.end * FLOATS_PER_BODY
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn velocities(&self) -> &[f32] {
        &self.velocities
    }

    pub fn colors(&self) -> &[f32] {
        &self.colors
    }

    pub fn positions_mut(&mut self) -> &mut [f32] {
        self.dirty |= DIRTY_DATA;
        &mut self.positions
    }

    pub fn velocities_mut(&mut self) -> &mut [f32] {
        self.dirty |= DIRTY_DATA;
        &mut self.velocities
    }

    /// 从帧数据中复制本分区
    pub fn init_from(&mut self, frame: &FrameData) -> bool {
        let floats = self.float_range();
        if frame.num_bodies() != self.num_bodies || floats.end > frame.positions().len() {
            return false;
        }
        self.positions.copy_from_slice(&frame.positions()[floats.clone()]);
        self.velocities
            .copy_from_slice(&frame.velocities()[floats.clone()]);
        self.colors.copy_from_slice(&frame.colors()[floats]);
        self.dirty |= DIRTY_DATA;
        true
    }

    fn serialize(&self, buf: &mut BytesMut, dirty: u64) {
        buf.put_u64_le(dirty);
        if dirty & DIRTY_RANGE != 0 {
            buf.put_u32_le(self.id);
            buf.put_f32_le(self.start);
            buf.put_f32_le(self.end);
            buf.put_u32_le(self.num_bodies);
        }
        if dirty & DIRTY_DATA != 0 {
            write_floats(buf, &self.positions);
            write_floats(buf, &self.velocities);
            write_floats(buf, &self.colors);
        }
    }

    fn deserialize(&mut self, stream: &mut &[u8]) -> Result<(), packet::Error> {
        let dirty = read_u64(stream)?;
        if dirty & DIRTY_RANGE != 0 {
            let id = read_u32(stream)?;
            let start = read_f32(stream)?;
            let end = read_f32(stream)?;
            if !valid_range(start, end) {
                return Err(packet::Error::MalformedPacket);
            }
            self.id = id;
            self.start = start;
            self.end = end;
            self.num_bodies = read_u32(stream)?;
        }
        if dirty & DIRTY_DATA != 0 {
            let expected = self.float_range().len();
            let positions = read_floats(stream)?;
            let velocities = read_floats(stream)?;
            let colors = read_floats(stream)?;
            if [&positions, &velocities, &colors]
                .iter()
                .any(|values| values.len() != expected)
            {
                return Err(packet::Error::MalformedPacket);
            }
            self.positions = positions;
            self.velocities = velocities;
            self.colors = colors;
        }
        Ok(())
    }
}

impl Distributed for DataProxy {
    fn get_instance_data(&self, buf: &mut BytesMut) {
        self.serialize(buf, DIRTY_ALL);
    }

    fn apply_instance_data(&mut self, data: &mut &[u8]) -> Result<(), packet::Error> {
        self.deserialize(data)
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.serialize(buf, self.dirty);
    }

    fn unpack(&mut self, data: &mut &[u8]) -> Result<(), packet::Error> {
        self.deserialize(data)
    }

    fn committed(&mut self) {
        self.dirty = 0;
    }
}
