use bytes::{BufMut, BytesMut};

use crate::{
    network::packet::{self, read_f32, read_u32, read_u64, read_u8},
    object::{self, Distributed, Version},
};

use super::{
    read_floats, valid_range, write_floats, DataProxy, DIRTY_ALL, DIRTY_DATA, DIRTY_FLAGS,
    DIRTY_PROXYDATA, FLOATS_PER_BODY,
};

/// 最多代理个数
pub const MAX_PROXIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
struct ProxyEntry {
    id: u32,
    version: Version,
    /// 本次提交中该代理覆盖的区间长度
    range: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameData {
    dirty: u64,
    statistics: bool,
    num_bodies: u32,
    cluster_scale: f32,
    velocity_scale: f32,
    delta_time: f32,
    new_parameters: bool,
    positions: Vec<f32>,
    velocities: Vec<f32>,
    colors: Vec<f32>,
    proxies: Vec<ProxyEntry>,
}

impl Default for FrameData {
    fn default() -> Self {
        Self {
            dirty: 0,
            statistics: true,
            num_bodies: 0,
            cluster_scale: 0.0,
            velocity_scale: 0.0,
            delta_time: 0.0,
            new_parameters: false,
            positions: Vec::new(),
            velocities: Vec::new(),
            colors: Vec::new(),
            proxies: Vec::new(),
        }
    }
}

impl FrameData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    fn set_dirty(&mut self, bits: u64) {
        self.dirty |= bits;
    }

    pub fn init(&mut self, num_bodies: u32) {
        self.num_bodies = num_bodies;
        self.set_dirty(DIRTY_FLAGS);
    }

    /// 分配并清零主机数组
    pub fn init_host_data(&mut self) {
        let len = self.num_bodies as usize * FLOATS_PER_BODY;
        self.positions = vec![0.0; len];
        self.velocities = vec![0.0; len];
        self.colors = vec![0.0; len];
        self.set_dirty(DIRTY_DATA);
    }

    pub fn exit(&mut self) {
        self.proxies.clear();
        self.num_bodies = 0;
        self.positions = Vec::new();
        self.velocities = Vec::new();
        self.colors = Vec::new();
    }

    pub fn update_parameters(&mut self, cluster_scale: f32, velocity_scale: f32, delta_time: f32) {
        self.cluster_scale = cluster_scale;
        self.velocity_scale = velocity_scale;
        self.delta_time = delta_time;
        self.new_parameters = true;
        self.set_dirty(DIRTY_DATA | DIRTY_FLAGS);
    }

    pub fn toggle_statistics(&mut self) {
        self.statistics = !self.statistics;
        self.set_dirty(DIRTY_FLAGS);
    }

    pub fn statistics(&self) -> bool {
        self.statistics
    }

    pub fn num_bodies(&self) -> u32 {
        self.num_bodies
    }

    pub fn cluster_scale(&self) -> f32 {
        self.cluster_scale
    }

    pub fn velocity_scale(&self) -> f32 {
        self.velocity_scale
    }

    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    pub fn new_parameters(&self) -> bool {
        self.new_parameters
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
        self.set_dirty(DIRTY_DATA);
        &mut self.positions
    }

    pub fn velocities_mut(&mut self) -> &mut [f32] {
        self.set_dirty(DIRTY_DATA);
        &mut self.velocities
    }

    pub fn colors_mut(&mut self) -> &mut [f32] {
        self.set_dirty(DIRTY_DATA);
        &mut self.colors
    }

    /// 登记代理，区间为 `[start, end)`，版本未知
    pub fn add_proxy_id(&mut self, id: u32, start: f32, end: f32) -> Result<(), object::Error> {
        if !valid_range(start, end) {
            return Err(object::Error::InvalidRange { start, end });
        }
        if self.proxies.len() >= MAX_PROXIES {
            return Err(object::Error::TooManyProxies(MAX_PROXIES));
        }
        self.proxies.push(ProxyEntry {
            id,
            version: Version::NONE,
            range: end - start,
        });
        self.set_dirty(DIRTY_PROXYDATA);
        Ok(())
    }

    /// 更新代理提交的版本和区间，代理不存在时返回 false
    pub fn update_proxy_id(&mut self, id: u32, version: Version, start: f32, end: f32) -> bool {
        let found = match self.proxies.iter_mut().find(|proxy| proxy.id == id) {
            Some(proxy) => {
                proxy.version = version;
                proxy.range = end - start;
                true
            }
            None => false,
        };
        self.set_dirty(DIRTY_PROXYDATA);
        found
    }

    pub fn version_for_proxy_id(&self, id: u32) -> Version {
        self.proxies
            .iter()
            .find(|proxy| proxy.id == id)
            .map_or(Version::NONE, |proxy| proxy.version)
    }

    pub fn proxy_ids(&self) -> Vec<u32> {
        self.proxies.iter().map(|proxy| proxy.id).collect()
    }

    /// 所有代理的区间长度之和恰好为 1.0
    pub fn is_ready(&self) -> bool {
        let length: f32 = self.proxies.iter().map(|proxy| proxy.range).sum();
        length == 1.0
    }

    /// 把代理的分区数据写入主机数组，并记录代理的版本
    pub fn update_from_proxy(&mut self, proxy: &DataProxy, version: Version) -> bool {
        let (start, end) = proxy.range();
        let floats = proxy.float_range();
        if proxy.num_bodies() != self.num_bodies || floats.end > self.positions.len() {
            return false;
        }
        self.positions[floats.clone()].copy_from_slice(proxy.positions());
        self.velocities[floats.clone()].copy_from_slice(proxy.velocities());
        self.colors[floats].copy_from_slice(proxy.colors());
        self.set_dirty(DIRTY_DATA);
        self.update_proxy_id(proxy.id(), version, start, end)
    }

    fn serialize(&self, buf: &mut BytesMut, dirty: u64) {
        buf.put_u64_le(dirty);
        if dirty & DIRTY_DATA != 0 {
            write_floats(buf, &self.positions);
            write_floats(buf, &self.velocities);
            write_floats(buf, &self.colors);
        }
        if dirty & DIRTY_FLAGS != 0 {
            buf.put_u8(self.statistics as u8);
            buf.put_u32_le(self.num_bodies);
            buf.put_f32_le(self.cluster_scale);
            buf.put_f32_le(self.velocity_scale);
            buf.put_f32_le(self.delta_time);
            buf.put_u8(self.new_parameters as u8);
        }
        if dirty & DIRTY_PROXYDATA != 0 {
            buf.put_u32_le(self.proxies.len() as u32);
            for proxy in &self.proxies {
                buf.put_u32_le(proxy.id);
                buf.put_u32_le(proxy.version.0);
                buf.put_f32_le(proxy.range);
            }
        }
    }

    fn deserialize(&mut self, stream: &mut &[u8]) -> Result<(), packet::Error> {
        let dirty = read_u64(stream)?;
        if dirty & DIRTY_DATA != 0 {
            self.positions = read_floats(stream)?;
            self.velocities = read_floats(stream)?;
            self.colors = read_floats(stream)?;
        }
        if dirty & DIRTY_FLAGS != 0 {
            self.statistics = read_u8(stream)? != 0;
            self.num_bodies = read_u32(stream)?;
            self.cluster_scale = read_f32(stream)?;
            self.velocity_scale = read_f32(stream)?;
            self.delta_time = read_f32(stream)?;
            self.new_parameters = read_u8(stream)? != 0;
        }
        if dirty & DIRTY_PROXYDATA != 0 {
            let len = read_u32(stream)? as usize;
            if len > MAX_PROXIES {
                return Err(packet::Error::MalformedPacket);
            }
            self.proxies = (0..len)
                .map(|_| {
                    Ok(ProxyEntry {
                        id: read_u32(stream)?,
                        version: Version(read_u32(stream)?),
                        range: read_f32(stream)?,
                    })
                })
                .collect::<Result<_, packet::Error>>()?;
        }
        Ok(())
    }
}

impl Distributed for FrameData {
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

    /// 每次提交后区间清零，下一帧需要所有代理重新报告
    fn committed(&mut self) {
        for proxy in &mut self.proxies {
            proxy.range = 0.0;
        }
        self.dirty = 0;
        self.new_parameters = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_when_ranges_cover_unit() {
        let mut frame = FrameData::new();
        frame.add_proxy_id(1, 0.0, 0.5).unwrap();
        assert!(!frame.is_ready());
        frame.add_proxy_id(2, 0.5, 1.0).unwrap();
        assert!(frame.is_ready());

        let mut partial = FrameData::new();
        partial.add_proxy_id(1, 0.0, 0.4).unwrap();
        assert!(!partial.is_ready());
    }

    #[test]
    fn commit_resets_ranges() {
        let mut frame = FrameData::new();
        frame.add_proxy_id(1, 0.0, 0.5).unwrap();
        frame.add_proxy_id(2, 0.5, 1.0).unwrap();
        frame.committed();
        assert!(!frame.is_ready());
        assert_eq!(frame.dirty(), 0);

        assert!(frame.update_proxy_id(1, Version(3), 0.0, 0.5));
        assert!(frame.update_proxy_id(2, Version(4), 0.5, 1.0));
        assert!(!frame.update_proxy_id(9, Version(4), 0.0, 1.0));
        assert!(frame.is_ready());
        assert_eq!(frame.version_for_proxy_id(2), Version(4));
        assert_eq!(frame.version_for_proxy_id(9), Version::NONE);
    }

    #[test]
    fn proxy_limits() {
        let mut frame = FrameData::new();
        assert!(frame.add_proxy_id(1, 0.5, 0.5).is_err());
        assert!(frame.add_proxy_id(1, -0.1, 0.5).is_err());
        for id in 0..MAX_PROXIES as u32 {
            frame.add_proxy_id(id, 0.0, 0.1).unwrap();
        }
        assert!(matches!(
            frame.add_proxy_id(99, 0.0, 0.1),
            Err(object::Error::TooManyProxies(MAX_PROXIES))
        ));
    }

    #[test]
    fn delta_carries_only_dirty_sections() {
        let mut master = FrameData::new();
        master.init(2);
        master.init_host_data();
        master.add_proxy_id(7, 0.0, 1.0).unwrap();

        let mut slave = FrameData::new();
        let mut buf = BytesMut::new();
        master.get_instance_data(&mut buf);
        slave.apply_instance_data(&mut &buf[..]).unwrap();
        assert_eq!(slave.num_bodies(), 2);
        assert_eq!(slave.proxy_ids(), vec![7]);
        assert!(slave.is_ready());
        master.committed();

        master.toggle_statistics();
        let mut delta = BytesMut::new();
        master.pack(&mut delta);
        // dirty + 标志位
        assert_eq!(delta.len(), 8 + 1 + 4 + 4 + 4 + 4 + 1);
        slave.unpack(&mut &delta[..]).unwrap();
        assert!(!slave.statistics());
        assert_eq!(slave.positions().len(), 8);
    }

    #[test]
    fn truncated_data_rejected() {
        let mut frame = FrameData::new();
        frame.init(4);
        frame.init_host_data();
        let mut buf = BytesMut::new();
        frame.get_instance_data(&mut buf);
        let truncated = &buf[..buf.len() - 3];
        assert!(FrameData::new()
            .apply_instance_data(&mut &truncated[..])
            .is_err());
    }
}
