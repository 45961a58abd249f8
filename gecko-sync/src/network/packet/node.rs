//! 节点间的管理报文（DATATYPE_NODE）

use bytes::{BufMut, BytesMut};

use super::{
    expect, read_slice, read_string, read_u32, read_u64, read_u8, string_len, write_string, Error,
    Packet, DATATYPE_NODE, INVALID_ID,
};

pub const CMD_NODE_STOP: u32 = 0;
pub const CMD_NODE_MESSAGE: u32 = 1;
pub const CMD_NODE_MAP_SESSION: u32 = 2;
pub const CMD_NODE_MAP_SESSION_REPLY: u32 = 3;
pub const CMD_NODE_CONNECT: u32 = 4;
/// 应用自定义的节点命令从这里开始
pub const CMD_NODE_CUSTOM: u32 = 16;

/// 节点消息中元素的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Byte,
    Short,
    Integer,
    Float,
}

impl MessageType {
    /// 单个元素的字节数
    pub fn element_size(&self) -> usize {
        match self {
            MessageType::Byte => 1,
            MessageType::Short => 2,
            MessageType::Integer | MessageType::Float => 4,
        }
    }
}

impl From<MessageType> for u32 {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Byte => 0,
            MessageType::Short => 1,
            MessageType::Integer => 2,
            MessageType::Float => 3,
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageType::Byte,
            1 => MessageType::Short,
            2 => MessageType::Integer,
            3 => MessageType::Float,
            n => return Err(Error::InvalidMessageType(n)),
        })
    }
}

/// 停止接收循环
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStopPacket;

impl NodeStopPacket {
    pub fn to_packet(&self) -> Packet {
        Packet::new(DATATYPE_NODE, CMD_NODE_STOP, &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessagePacket {
    pub kind: MessageType,
    pub n_elements: u64,
    pub data: Vec<u8>,
}

impl NodeMessagePacket {
    pub fn new(kind: MessageType, data: &[u8]) -> Self {
        // 不足一个元素的尾部字节被丢弃
        let n_elements = data.len() / kind.element_size();
        Self {
            kind,
            n_elements: n_elements as u64,
            data: data[..n_elements * kind.element_size()].to_vec(),
        }
    }

    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_NODE, &[CMD_NODE_MESSAGE])?;
        let mut stream = packet.body();
        let kind = MessageType::try_from(read_u32(&mut stream)?)?;
        let _pad = read_u32(&mut stream)?;
        let n_elements = read_u64(&mut stream)?;
        let len = (n_elements as usize)
            .checked_mul(kind.element_size())
            .ok_or(Error::MalformedPacket)?;
        let data = read_slice(&mut stream, len)?.to_vec();
        Ok(Self {
            kind,
            n_elements,
            data,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(16 + self.data.len());
        body.put_u32_le(self.kind.into());
        body.put_u32_le(0);
        body.put_u64_le(self.n_elements);
        body.extend_from_slice(&self.data);
        Packet::new(DATATYPE_NODE, CMD_NODE_MESSAGE, &body)
    }
}

/// 请求映射会话，session_id 为 INVALID_ID 时按名称查找
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMapSessionPacket {
    pub request_id: u32,
    pub session_id: u32,
    pub name: String,
}

/// 会话映射结果，session_id 为 INVALID_ID 表示映射失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMapSessionReplyPacket {
    pub request_id: u32,
    pub session_id: u32,
    pub name: String,
}

impl NodeMapSessionReplyPacket {
    pub fn failed(request_id: u32) -> Self {
        Self {
            request_id,
            session_id: INVALID_ID,
            name: String::new(),
        }
    }
}

macro_rules! map_session_codec {
    ($ty:ident, $cmd:expr) => {
        impl $ty {
            pub fn read_from(packet: &Packet) -> Result<Self, Error> {
                expect(packet, DATATYPE_NODE, &[$cmd])?;
                let mut stream = packet.body();
                let request_id = read_u32(&mut stream)?;
                let session_id = read_u32(&mut stream)?;
                let name_len = read_u32(&mut stream)?;
                let _pad = read_u32(&mut stream)?;
                let name = read_string(&mut stream, name_len as usize)?;
                Ok(Self {
                    request_id,
                    session_id,
                    name,
                })
            }

            pub fn to_packet(&self) -> Packet {
                let mut body = BytesMut::with_capacity(24 + self.name.len());
                body.put_u32_le(self.request_id);
                body.put_u32_le(self.session_id);
                if self.name.is_empty() {
                    body.put_u32_le(0);
                    body.put_u32_le(0);
                } else {
                    body.put_u32_le(string_len(&self.name));
                    body.put_u32_le(0);
                    write_string(&mut body, &self.name);
                }
                Packet::new(DATATYPE_NODE, $cmd, &body)
            }
        }
    };
}

map_session_codec!(NodeMapSessionPacket, CMD_NODE_MAP_SESSION);
map_session_codec!(NodeMapSessionReplyPacket, CMD_NODE_MAP_SESSION_REPLY);

/// 连接握手，新连接上的第一个报文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConnectPacket {
    pub was_launched: bool,
    pub launch_id: u64,
}

impl NodeConnectPacket {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        expect(packet, DATATYPE_NODE, &[CMD_NODE_CONNECT])?;
        let mut stream = packet.body();
        let was_launched = read_u8(&mut stream)? != 0;
        read_slice(&mut stream, 7)?;
        let launch_id = read_u64(&mut stream)?;
        Ok(Self {
            was_launched,
            launch_id,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut body = BytesMut::with_capacity(16);
        body.put_u8(self.was_launched as u8);
        body.put_bytes(0, 7);
        body.put_u64_le(self.launch_id);
        Packet::new(DATATYPE_NODE, CMD_NODE_CONNECT, &body)
    }
}

/// 已解码的节点命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Stop,
    Message(NodeMessagePacket),
    MapSession(NodeMapSessionPacket),
    MapSessionReply(NodeMapSessionReplyPacket),
    Connect(NodeConnectPacket),
    Custom(u32),
}

impl NodeCommand {
    pub fn read_from(packet: &Packet) -> Result<Self, Error> {
        Ok(match packet.command() {
            CMD_NODE_STOP => NodeCommand::Stop,
            CMD_NODE_MESSAGE => NodeCommand::Message(NodeMessagePacket::read_from(packet)?),
            CMD_NODE_MAP_SESSION => {
                NodeCommand::MapSession(NodeMapSessionPacket::read_from(packet)?)
            }
            CMD_NODE_MAP_SESSION_REPLY => {
                NodeCommand::MapSessionReply(NodeMapSessionReplyPacket::read_from(packet)?)
            }
            CMD_NODE_CONNECT => NodeCommand::Connect(NodeConnectPacket::read_from(packet)?),
            cmd if cmd >= CMD_NODE_CUSTOM => NodeCommand::Custom(cmd),
            cmd => {
                return Err(Error::UnexpectedPacket {
                    datatype: packet.datatype(),
                    command: cmd,
                })
            }
        })
    }
}
