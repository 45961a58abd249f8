//! 会话报文（DATATYPE_SESSION / DATATYPE_USER）
//! 所有会话相关报文的第一个字段都是 session_id

use bytes::{BufMut, BytesMut};

use super::{expect, read_u32, Error, Packet, DATATYPE_SESSION, DATATYPE_USER};

pub const CMD_SESSION_GEN_IDS: u32 = 0;
pub const CMD_SESSION_GEN_IDS_REPLY: u32 = 1;

/// 读取报文中的 session_id
pub fn session_id(packet: &Packet) -> Result<u32, Error> {
    let mut stream = packet.body();
    read_u32(&mut stream)
}

/// 向主会话申请一段连续的 id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGenIdsPacket {
    pub session_id: u32,
    pub request_id: u32,
    pub range: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGenIdsReplyPacket {
    pub session_id: u32,
    pub request_id: u32,
    /// 分配到的第一个 id
    pub id: u32,
}

impl SessionGenIdsPacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_SESSION, &[CMD_SESSION_GEN_IDS])?;
        let mut stream = packet.body();
        Ok(Self {
            session_id: read_u32(&mut stream)?,
            request_id: read_u32(&mut stream)?,
            range: read_u32(&mut stream)?,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(16);
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.request_id);
        body.put_u32_le(self.range);
        body.put_u32_le(0);
        Packet::new(DATATYPE_SESSION, CMD_SESSION_GEN_IDS, &body)
    }
}

impl SessionGenIdsReplyPacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_SESSION, &[CMD_SESSION_GEN_IDS_REPLY])?;
        let mut stream = packet.body();
        Ok(Self {
            session_id: read_u32(&mut stream)?,
            request_id: read_u32(&mut stream)?,
            id: read_u32(&mut stream)?,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(16);
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.request_id);
        body.put_u32_le(self.id);
        body.put_u32_le(0);
        Packet::new(DATATYPE_SESSION, CMD_SESSION_GEN_IDS_REPLY, &body)
    }
}

/// 应用层报文，command 由应用自行定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPacket {
    pub session_id: u32,
    pub user_id: u32,
    pub command: u32,
    pub data: Vec<u8>,
}

impl UserPacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        if packet.datatype() != DATATYPE_USER {
            return Err(Error::UnexpectedPacket {
                datatype: packet.datatype(),
                command: packet.command(),
            });
        }
        let mut stream = packet.body();
        let session_id = read_u32(&mut stream)?;
        let user_id = read_u32(&mut stream)?;
        Ok(Self {
            session_id,
            user_id,
            command: packet.command(),
            data: stream.to_vec(),
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(8 + self.data.len());
        body.put_u32_le(self.session_id);
        body.put_u32_le(self.user_id);
        body.extend_from_slice(&self.data);
        Packet::new(DATATYPE_USER, self.command, &body)
    }
}
