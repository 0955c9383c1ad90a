//! Fixed-newstyle handshake and option haggling.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use super::constants::*;
use super::export::ExportDescriptor;
use crate::error::{BridgeError, Result};

/// What the client agreed to during negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub structured_replies: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Enter the transmission phase.
    Transmission(Negotiated),
    /// Client sent `NBD_OPT_ABORT`.
    Aborted,
}

/// Parsed `NBD_OPT_INFO` / `NBD_OPT_GO` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InfoRequest {
    name: String,
    requests: Vec<u16>,
}

impl InfoRequest {
    fn parse(data: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(data);
        let name_len = cursor.read_u32::<BigEndian>()? as usize;
        if name_len > data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name)?;
        let count = cursor.read_u16::<BigEndian>()?;
        let mut requests = Vec::with_capacity(count as usize);
        for _ in 0..count {
            requests.push(cursor.read_u16::<BigEndian>()?);
        }
        if cursor.position() as usize != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes in info request",
            ));
        }
        let name = String::from_utf8(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self { name, requests })
    }
}

fn send_option_reply<W: Write>(
    stream: &mut W,
    option: u32,
    reply_type: u32,
    payload: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(20 + payload.len());
    buf.write_u64::<BigEndian>(NBD_REP_MAGIC)?;
    buf.write_u32::<BigEndian>(option)?;
    buf.write_u32::<BigEndian>(reply_type)?;
    buf.write_u32::<BigEndian>(payload.len() as u32)?;
    buf.extend_from_slice(payload);
    stream.write_all(&buf)
}

fn send_info<W: Write>(stream: &mut W, option: u32, info_type: u16, body: &[u8]) -> io::Result<()> {
    let mut payload = Vec::with_capacity(2 + body.len());
    payload.write_u16::<BigEndian>(info_type)?;
    payload.extend_from_slice(body);
    send_option_reply(stream, option, NBD_REP_INFO, &payload)
}

fn send_export_info<W: Write>(
    stream: &mut W,
    option: u32,
    export: &ExportDescriptor,
    requests: &[u16],
) -> io::Result<()> {
    let mut body = Vec::with_capacity(10);
    body.write_u64::<BigEndian>(export.size_bytes)?;
    body.write_u16::<BigEndian>(export.transmission_flags())?;
    send_info(stream, option, NBD_INFO_EXPORT, &body)?;

    if requests.contains(&NBD_INFO_NAME) {
        send_info(stream, option, NBD_INFO_NAME, export.name.as_bytes())?;
    }
    if requests.contains(&NBD_INFO_DESCRIPTION) {
        send_info(stream, option, NBD_INFO_DESCRIPTION, export.description.as_bytes())?;
    }

    let (min, preferred, max) = export.block_sizes();
    let mut body = Vec::with_capacity(12);
    body.write_u32::<BigEndian>(min)?;
    body.write_u32::<BigEndian>(preferred)?;
    body.write_u32::<BigEndian>(max)?;
    send_info(stream, option, NBD_INFO_BLOCK_SIZE, &body)
}

/// Run the handshake on a freshly accepted connection.
///
/// Protocol violations and unknown export names in `NBD_OPT_EXPORT_NAME`
/// return an error; the caller closes the connection.
pub fn negotiate<S: Read + Write>(
    stream: &mut S,
    export: &ExportDescriptor,
) -> Result<HandshakeOutcome> {
    let mut greeting = Vec::with_capacity(18);
    greeting.write_u64::<BigEndian>(NBD_MAGIC)?;
    greeting.write_u64::<BigEndian>(NBD_OPTS_MAGIC)?;
    greeting.write_u16::<BigEndian>(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)?;
    stream.write_all(&greeting)?;
    stream.flush()?;

    let client_flags = stream.read_u32::<BigEndian>()?;
    debug!(client_flags = %format!("0x{:x}", client_flags), "Client flags");
    if client_flags & !(NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES) != 0 {
        return Err(BridgeError::Protocol(format!(
            "unknown client flags 0x{:x}",
            client_flags
        )));
    }
    let no_zeroes = client_flags & NBD_FLAG_C_NO_ZEROES != 0;
    let mut negotiated = Negotiated::default();

    loop {
        let magic = stream.read_u64::<BigEndian>()?;
        if magic != NBD_OPTS_MAGIC {
            return Err(BridgeError::Protocol(format!(
                "bad option magic 0x{:x}",
                magic
            )));
        }
        let option = stream.read_u32::<BigEndian>()?;
        let length = stream.read_u32::<BigEndian>()?;
        if length > MAX_OPTION_BYTES {
            return Err(BridgeError::Protocol(format!(
                "option {} payload of {} bytes",
                option, length
            )));
        }
        let mut data = vec![0u8; length as usize];
        stream.read_exact(&mut data)?;
        debug!(option, length, "Option received");

        match option {
            NBD_OPT_EXPORT_NAME => {
                let name = String::from_utf8_lossy(&data);
                if !export.matches(&name) {
                    return Err(BridgeError::Protocol(format!("unknown export '{}'", name)));
                }
                let mut reply = Vec::with_capacity(10 + 124);
                reply.write_u64::<BigEndian>(export.size_bytes)?;
                reply.write_u16::<BigEndian>(export.transmission_flags())?;
                if !no_zeroes {
                    reply.extend_from_slice(&[0u8; 124]);
                }
                stream.write_all(&reply)?;
                stream.flush()?;
                return Ok(HandshakeOutcome::Transmission(negotiated));
            }

            NBD_OPT_ABORT => {
                send_option_reply(stream, option, NBD_REP_ACK, &[])?;
                stream.flush()?;
                return Ok(HandshakeOutcome::Aborted);
            }

            NBD_OPT_LIST => {
                if !data.is_empty() {
                    send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[])?;
                    continue;
                }
                let mut entry = Vec::with_capacity(4 + export.name.len());
                entry.write_u32::<BigEndian>(export.name.len() as u32)?;
                entry.extend_from_slice(export.name.as_bytes());
                send_option_reply(stream, option, NBD_REP_SERVER, &entry)?;
                send_option_reply(stream, option, NBD_REP_ACK, &[])?;
            }

            NBD_OPT_INFO | NBD_OPT_GO => {
                let request = match InfoRequest::parse(&data) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "Malformed info request");
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[])?;
                        continue;
                    }
                };
                if !export.matches(&request.name) {
                    let message = format!("unknown export '{}'", request.name);
                    send_option_reply(stream, option, NBD_REP_ERR_UNKNOWN, message.as_bytes())?;
                    continue;
                }
                send_export_info(stream, option, export, &request.requests)?;
                send_option_reply(stream, option, NBD_REP_ACK, &[])?;
                if option == NBD_OPT_GO {
                    stream.flush()?;
                    return Ok(HandshakeOutcome::Transmission(negotiated));
                }
            }

            NBD_OPT_STRUCTURED_REPLY => {
                if !data.is_empty() {
                    send_option_reply(stream, option, NBD_REP_ERR_INVALID, &[])?;
                    continue;
                }
                negotiated.structured_replies = true;
                send_option_reply(stream, option, NBD_REP_ACK, &[])?;
            }

            _ => {
                warn!(option, "Unsupported option");
                send_option_reply(stream, option, NBD_REP_ERR_UNSUP, &[])?;
            }
        }
        stream.flush()?;
    }
}
