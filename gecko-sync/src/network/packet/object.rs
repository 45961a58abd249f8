//! 分布式对象报文（DATATYPE_OBJECT / DATATYPE_MOBJECT）
//! 字段依次为 session_id, object_id, ...

use std::time::Duration;

use bytes::{BufMut, BytesMut};

use super::{
    expect, read_slice, read_u32, read_u64, Error, Packet, DATATYPE_MOBJECT, DATATYPE_OBJECT,
};

pub const CMD_OBJECT_SUBSCRIBE: u32 = 0;
pub const CMD_OBJECT_SUBSCRIBE_REPLY: u32 = 1;
/// 完整实例数据，进入从对象队列后变为 REQ_OBJECT_INSTANCE
pub const CMD_OBJECT_INSTANCE: u32 = 2;
pub const REQ_OBJECT_INSTANCE: u32 = CMD_OBJECT_INSTANCE + 1;
/// 增量数据，进入从对象队列后变为 REQ_OBJECT_DELTA
pub const CMD_OBJECT_DELTA: u32 = 4;
pub const REQ_OBJECT_DELTA: u32 = CMD_OBJECT_DELTA + 1;
pub const CMD_OBJECT_UNSUBSCRIBE: u32 = 6;

pub const CMD_BARRIER_ENTER: u32 = 0;
pub const CMD_BARRIER_ENTER_REPLY: u32 = 1;
/// 等待超时的参与者撤回之前的进入请求
pub const CMD_BARRIER_LEAVE: u32 = 2;
/// 进入屏障时不限制等待时间
pub const BARRIER_TIMEOUT_INDEFINITE: u32 = u32::MAX;

/// 读取报文中的 object_id
pub fn object_id(packet: &Packet) -> Result<u32, Error> {
    let mut stream = packet.body();
    let _session_id = read_u32(&mut stream)?;
    read_u32(&mut stream)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSubscribePacket {
    pub session_id: u32,
    pub object_id: u32,
    pub request_id: u32,
}

impl ObjectSubscribePacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_OBJECT, &[CMD_OBJECT_SUBSCRIBE])?;
        let mut stream = packet.body();
        Ok(Self {
            session_id: read_u32(&mut stream)?,
            object_id: read_u32(&mut stream)?,
            request_id: read_u32(&mut stream)?,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(16);
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.object_id);
        body.put_u32_le(self.request_id);
        Packet::new(DATATYPE_OBJECT, CMD_OBJECT_SUBSCRIBE, &body)
    }
}

/// 订阅结果，成功时 version 为实例数据的版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSubscribeReplyPacket {
    pub session_id: u32,
    pub object_id: u32,
    pub request_id: u32,
    pub result: bool,
    pub version: u32,
}

impl ObjectSubscribeReplyPacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_OBJECT, &[CMD_OBJECT_SUBSCRIBE_REPLY])?;
        let mut stream = packet.body();
        let session_id = read_u32(&mut stream)?;
        let object_id = read_u32(&mut stream)?;
        let request_id = read_u32(&mut stream)?;
        let result = read_u32(&mut stream)? != 0;
        let version = read_u32(&mut stream)?;
        Ok(Self {
            session_id,
            object_id,
            request_id,
            result,
            version,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(24);
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.object_id);
        body.put_u32_le(self.request_id);
        body.put_u32_le(self.result as u32);
        body.put_u32_le(self.version);
        body.put_u32_le(0);
        Packet::new(DATATYPE_OBJECT, CMD_OBJECT_SUBSCRIBE_REPLY, &body)
    }
}

/// 实例或增量数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDataPacket {
    pub command: u32,
    pub session_id: u32,
    pub object_id: u32,
    pub version: u32,
    pub data: Vec<u8>,
}

impl ObjectDataPacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(
            packet,
            DATATYPE_OBJECT,
            &[
                CMD_OBJECT_INSTANCE,
                REQ_OBJECT_INSTANCE,
                CMD_OBJECT_DELTA,
                REQ_OBJECT_DELTA,
            ],
        )?;
        let mut stream = packet.body();
        let session_id = read_u32(&mut stream)?;
        let object_id = read_u32(&mut stream)?;
        let version = read_u32(&mut stream)?;
        let _pad = read_u32(&mut stream)?;
        let len = read_u64(&mut stream)?;
        let len = usize::try_from(len).map_err(|_| Error::MalformedPacket)?;
        let data = read_slice(&mut stream, len)?.to_vec();
        Ok(Self {
            command: packet.command(),
            session_id,
            object_id,
            version,
            data,
        })
    }

    pub fn is_instance(&self) -> bool {
        self.command == CMD_OBJECT_INSTANCE || self.command == REQ_OBJECT_INSTANCE
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(24 + self.data.len());
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.object_id);
        body.put_u32_le(self.version);
        body.put_u32_le(0);
        body.put_u64_le(self.data.len() as u64);
        body.extend_from_slice(&self.data);
        Packet::new(DATATYPE_OBJECT, self.command, &body)
    }
}

/// 读取数据报文中的版本号，不复制数据
pub fn data_version(packet: &Packet) -> Result<u32, Error> {
    let mut stream = packet.body();
    let _session_id = read_u32(&mut stream)?;
    let _object_id = read_u32(&mut stream)?;
    read_u32(&mut stream)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectUnsubscribePacket {
    pub session_id: u32,
    pub object_id: u32,
}

impl ObjectUnsubscribePacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_OBJECT, &[CMD_OBJECT_UNSUBSCRIBE])?;
        let mut stream = packet.body();
        Ok(Self {
            session_id: read_u32(&mut stream)?,
            object_id: read_u32(&mut stream)?,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(8);
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.object_id);
        Packet::new(DATATYPE_OBJECT, CMD_OBJECT_UNSUBSCRIBE, &body)
    }
}

/// 屏障报文，进入，回复和撤回共用此格式
///
/// timeout_ms 是进入者等待的时限，超过后主屏障不再计入该请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPacket {
    pub command: u32,
    pub session_id: u32,
    pub object_id: u32,
    pub request_id: u32,
    pub timeout_ms: u32,
}

impl BarrierPacket {
    pub fn enter(session_id: u32, object_id: u32, request_id: u32, timeout: Option<Duration>) -> Self {
        let timeout_ms = match timeout {
            Some(timeout) => u32::try_from(timeout.as_millis())
                .unwrap_or(BARRIER_TIMEOUT_INDEFINITE - 1),
            None => BARRIER_TIMEOUT_INDEFINITE,
        };
        Self {
            command: CMD_BARRIER_ENTER,
            session_id,
            object_id,
            request_id,
            timeout_ms,
        }
    }

    pub fn reply(&self) -> Self {
        Self {
            command: CMD_BARRIER_ENTER_REPLY,
            ..*self
        }
    }

    pub fn leave(&self) -> Self {
        Self {
            command: CMD_BARRIER_LEAVE,
            ..*self
        }
    }

    /// 进入者的等待时限，None 表示无限等待
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            BARRIER_TIMEOUT_INDEFINITE => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(
            packet,
            DATATYPE_MOBJECT,
            &[CMD_BARRIER_ENTER, CMD_BARRIER_ENTER_REPLY, CMD_BARRIER_LEAVE],
        )?;
        let mut stream = packet.body();
        Ok(Self {
            command: packet.command(),
            session_id: read_u32(&mut stream)?,
            object_id: read_u32(&mut stream)?,
            request_id: read_u32(&mut stream)?,
            timeout_ms: read_u32(&mut stream)?,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(16);
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.object_id);
        body.put_u32_le(self.request_id);
        body.put_u32_le(self.timeout_ms);
        Packet::new(DATATYPE_MOBJECT, self.command, &body)
    }
}
