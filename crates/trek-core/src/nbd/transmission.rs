//! Transmission-phase wire format: request headers and replies.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::constants::*;
use crate::error::BridgeError;
use crate::events::RequestKind;

/// A transmission request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub magic: u32,
    pub flags: u16,
    pub command: u16,
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub fn new(command: u16, cookie: u64, offset: u64, length: u32) -> Self {
        Self {
            magic: NBD_REQUEST_MAGIC,
            flags: 0,
            command,
            cookie,
            offset,
            length,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        reader.read_exact(&mut header)?;
        Self::from_bytes(&header)
    }

    pub fn from_bytes(header: &[u8; REQUEST_HEADER_LEN]) -> io::Result<Self> {
        let mut cursor = &header[..];
        Ok(Self {
            magic: cursor.read_u32::<BigEndian>()?,
            flags: cursor.read_u16::<BigEndian>()?,
            command: cursor.read_u16::<BigEndian>()?,
            cookie: cursor.read_u64::<BigEndian>()?,
            offset: cursor.read_u64::<BigEndian>()?,
            length: cursor.read_u32::<BigEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        header[0..4].copy_from_slice(&self.magic.to_be_bytes());
        header[4..6].copy_from_slice(&self.flags.to_be_bytes());
        header[6..8].copy_from_slice(&self.command.to_be_bytes());
        header[8..16].copy_from_slice(&self.cookie.to_be_bytes());
        header[16..24].copy_from_slice(&self.offset.to_be_bytes());
        header[24..28].copy_from_slice(&self.length.to_be_bytes());
        header
    }

    pub fn kind(&self) -> RequestKind {
        match self.command {
            NBD_CMD_READ => RequestKind::Read,
            NBD_CMD_WRITE => RequestKind::Write,
            NBD_CMD_DISC => RequestKind::Disconnect,
            NBD_CMD_FLUSH => RequestKind::Flush,
            other => RequestKind::Other(other),
        }
    }
}

/// Map a bridge failure onto the errno carried in NBD replies.
pub fn wire_error(err: &BridgeError) -> u32 {
    match err {
        BridgeError::OutOfRange { .. }
        | BridgeError::Misaligned { .. }
        | BridgeError::UnalignedWrite { .. }
        | BridgeError::Protocol(_) => NBD_EINVAL,
        BridgeError::ReadOnly => NBD_EPERM,
        BridgeError::SessionClosed => NBD_ESHUTDOWN,
        BridgeError::IoTimeout { .. }
        | BridgeError::ShortTransfer { .. }
        | BridgeError::Transport(_)
        | BridgeError::Io(_)
        | BridgeError::InitFailed(_)
        | BridgeError::MalformedResponse(_) => NBD_EIO,
    }
}

/// Write a simple reply, followed by `payload` on success.
pub fn send_simple_reply<W: Write>(
    stream: &mut W,
    cookie: u64,
    error: u32,
    payload: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.write_u32::<BigEndian>(NBD_SIMPLE_REPLY_MAGIC)?;
    buf.write_u32::<BigEndian>(error)?;
    buf.write_u64::<BigEndian>(cookie)?;
    if error == 0 {
        buf.extend_from_slice(payload);
    }
    stream.write_all(&buf)?;
    stream.flush()
}

fn structured_header(
    buf: &mut Vec<u8>,
    cookie: u64,
    reply_type: u16,
    length: u32,
) -> io::Result<()> {
    buf.write_u32::<BigEndian>(NBD_STRUCTURED_REPLY_MAGIC)?;
    buf.write_u16::<BigEndian>(NBD_REPLY_FLAG_DONE)?;
    buf.write_u16::<BigEndian>(reply_type)?;
    buf.write_u64::<BigEndian>(cookie)?;
    buf.write_u32::<BigEndian>(length)
}

/// Answer a read with a single `OFFSET_DATA` chunk that also ends the reply.
pub fn send_structured_data<W: Write>(
    stream: &mut W,
    cookie: u64,
    offset: u64,
    data: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(20 + 8 + data.len());
    structured_header(&mut buf, cookie, NBD_REPLY_TYPE_OFFSET_DATA, 8 + data.len() as u32)?;
    buf.write_u64::<BigEndian>(offset)?;
    buf.extend_from_slice(data);
    stream.write_all(&buf)?;
    stream.flush()
}

/// Answer a request with a single `ERROR` chunk that also ends the reply.
pub fn send_structured_error<W: Write>(
    stream: &mut W,
    cookie: u64,
    error: u32,
    message: &str,
) -> io::Result<()> {
    let message = &message.as_bytes()[..message.len().min(u16::MAX as usize)];
    let mut buf = Vec::with_capacity(20 + 6 + message.len());
    structured_header(&mut buf, cookie, NBD_REPLY_TYPE_ERROR, 6 + message.len() as u32)?;
    buf.write_u32::<BigEndian>(error)?;
    buf.write_u16::<BigEndian>(message.len() as u16)?;
    buf.extend_from_slice(message);
    stream.write_all(&buf)?;
    stream.flush()
}
