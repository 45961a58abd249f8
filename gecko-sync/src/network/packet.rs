//! 报文格式
//!
//! 每个报文都以固定的报文头开始：`{ size: u64, datatype: u32, command: u32 }`，
//! size 包含报文头本身，是从连接上需要读取的准确字节数。
//! 报文头之后的字段按照 C 结构体的对齐规则排列，所有整数使用小端序。

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

pub mod node;
pub mod object;
pub mod session;

/// 报文头长度
pub const HEADER_LEN: usize = 16;
/// 默认的报文长度上限，防止损坏或恶意的 size 字段导致巨量内存分配
pub const DEFAULT_MAX_PACKET_SIZE: u64 = 64 * 1024 * 1024;
/// 无效 id
pub const INVALID_ID: u32 = u32::MAX;

pub const DATATYPE_NODE: u32 = 0;
pub const DATATYPE_SESSION: u32 = 1;
pub const DATATYPE_OBJECT: u32 = 2;
pub const DATATYPE_MOBJECT: u32 = 3;
pub const DATATYPE_USER: u32 = 4;
/// 应用自定义的 datatype 从这里开始
pub const DATATYPE_CUSTOM: u32 = 1 << 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet size {0} smaller than header")]
    SizeTooSmall(u64),
    #[error("Packet size {size} exceeds maximum {max}")]
    SizeTooLarge { size: u64, max: u64 },
    #[error("Packet size field {declared} does not match {actual} bytes")]
    SizeMismatch { declared: u64, actual: usize },
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Malformed UTF-8 string")]
    MalformedString,
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u32),
    #[error("Unexpected packet: datatype {datatype} command {command}")]
    UnexpectedPacket { datatype: u32, command: u32 },
}

/// 一个完整的报文（包含报文头）
///
/// 报文是值类型，进入缓存/队列时总是被复制，不在线程之间共享
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: BytesMut,
}

impl Packet {
    pub fn new(datatype: u32, command: u32, body: &[u8]) -> Self {
        let size = HEADER_LEN + body.len();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u64_le(size as u64);
        buf.put_u32_le(datatype);
        buf.put_u32_le(command);
        buf.extend_from_slice(body);
        Self { buf }
    }

    /// 从完整的报文字节构造，size 字段必须和实际长度一致
    pub fn from_bytes(buf: BytesMut) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::SizeTooSmall(buf.len() as u64));
        }
        let declared = le_u64(&buf[0..8]);
        if declared != buf.len() as u64 {
            return Err(Error::SizeMismatch {
                declared,
                actual: buf.len(),
            });
        }
        Ok(Self { buf })
    }

    /// 校验报文头中声明的长度，返回需要分配的字节数
    pub fn check_size(size: u64, max: u64) -> Result<usize, Error> {
        if size < HEADER_LEN as u64 {
            return Err(Error::SizeTooSmall(size));
        }
        if size > max {
            return Err(Error::SizeTooLarge { size, max });
        }
        Ok(size as usize)
    }

    pub fn size(&self) -> u64 {
        le_u64(&self.buf[0..8])
    }

    pub fn datatype(&self) -> u32 {
        le_u32(&self.buf[8..12])
    }

    pub fn command(&self) -> u32 {
        le_u32(&self.buf[12..16])
    }

    pub fn set_command(&mut self, command: u32) {
        self.buf[12..16].copy_from_slice(&command.to_le_bytes());
    }

    /// 报文头之后的内容
    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 复制到给定的缓冲区（缓冲区可能来自缓存池）
    pub(crate) fn copy_into(&self, mut buf: BytesMut) -> Packet {
        buf.clear();
        buf.extend_from_slice(&self.buf);
        Packet { buf }
    }

    pub(crate) fn into_inner(self) -> BytesMut {
        self.buf
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packet dt {} cmd {} size {}",
            self.datatype(),
            self.command(),
            self.size()
        )
    }
}

/// 检查报文类型
pub(crate) fn expect(packet: &Packet, datatype: u32, commands: &[u32]) -> Result<(), Error> {
    if packet.datatype() != datatype || !commands.contains(&packet.command()) {
        return Err(Error::UnexpectedPacket {
            datatype: packet.datatype(),
            command: packet.command(),
        });
    }
    Ok(())
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut stream = bytes;
    stream.get_u64_le()
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut stream = bytes;
    stream.get_u32_le()
}

/// 从流中读取小端整数，长度不足时返回 MalformedPacket
pub fn read_u8(stream: &mut &[u8]) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

pub fn read_u32(stream: &mut &[u8]) -> Result<u32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u32_le())
}

pub fn read_u64(stream: &mut &[u8]) -> Result<u64, Error> {
    if stream.len() < 8 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u64_le())
}

pub fn read_f32(stream: &mut &[u8]) -> Result<f32, Error> {
    if stream.len() < 4 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_f32_le())
}

/// 取出指定长度的字节
pub fn read_slice<'a>(stream: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    if stream.len() < len {
        return Err(Error::MalformedPacket);
    }
    let (head, tail) = stream.split_at(len);
    *stream = tail;
    Ok(head)
}

/// 读取以 NUL 结尾、按 8 字节对齐填充的字符串
/// len 是包含 NUL 的长度
pub(crate) fn read_string(stream: &mut &[u8], len: usize) -> Result<String, Error> {
    if len == 0 {
        return Ok(String::new());
    }
    let raw = read_slice(stream, padded_len(len))?;
    let bytes = &raw[..len];
    let bytes = match bytes.split_last() {
        Some((0, s)) => s,
        _ => return Err(Error::MalformedString),
    };
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::MalformedString)
}

/// 写入字符串，返回写入的逻辑长度（包含 NUL，不包含填充）
pub(crate) fn write_string(stream: &mut BytesMut, s: &str) -> u32 {
    let len = s.len() + 1;
    stream.extend_from_slice(s.as_bytes());
    stream.put_u8(0);
    stream.put_bytes(0, padded_len(len) - len);
    len as u32
}

/// 字符串在报文中占用的长度
pub(crate) fn string_len(s: &str) -> u32 {
    (s.len() + 1) as u32
}

pub(crate) fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let packet = Packet::new(DATATYPE_SESSION, 7, &[1, 2, 3, 4]);
        assert_eq!(packet.len(), 20);
        assert_eq!(packet.size(), 20);
        assert_eq!(&packet.as_bytes()[0..8], &20u64.to_le_bytes());
        assert_eq!(&packet.as_bytes()[8..12], &1u32.to_le_bytes());
        assert_eq!(&packet.as_bytes()[12..16], &7u32.to_le_bytes());
        assert_eq!(packet.body(), &[1, 2, 3, 4]);
    }

    #[test]
    fn set_command_rewrites_header_only() {
        let mut packet = Packet::new(DATATYPE_OBJECT, 4, &[9, 9]);
        packet.set_command(5);
        assert_eq!(packet.command(), 5);
        assert_eq!(packet.datatype(), DATATYPE_OBJECT);
        assert_eq!(packet.body(), &[9, 9]);
    }

    #[test]
    fn size_limits() {
        assert!(matches!(Packet::check_size(8, 1024), Err(Error::SizeTooSmall(8))));
        assert!(matches!(
            Packet::check_size(2048, 1024),
            Err(Error::SizeTooLarge { size: 2048, max: 1024 })
        ));
        assert_eq!(Packet::check_size(16, 1024).unwrap(), 16);
    }

    #[test]
    fn from_bytes_rejects_wrong_size_field() {
        let packet = Packet::new(DATATYPE_NODE, 0, &[0; 8]);
        let mut raw = BytesMut::from(packet.as_bytes());
        raw.truncate(20);
        assert!(matches!(
            Packet::from_bytes(raw),
            Err(Error::SizeMismatch { declared: 24, actual: 20 })
        ));
    }

    #[test]
    fn string_padding() {
        let mut stream = BytesMut::new();
        let len = write_string(&mut stream, "frame");
        assert_eq!(len, 6);
        assert_eq!(stream.len(), 8);

        let mut slice = &stream[..];
        assert_eq!(read_string(&mut slice, len as usize).unwrap(), "frame");
        assert!(slice.is_empty());
    }

    #[test]
    fn string_without_nul_is_malformed() {
        let raw = [b'a', b'b', 0, 0, 0, 0, 0, 0];
        let mut slice = &raw[..];
        assert!(matches!(
            read_string(&mut slice, 2),
            Err(Error::MalformedString)
        ));
    }
}
