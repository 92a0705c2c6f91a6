//! Utility and helper functions for hosts embedding the session core.
//!
//! The session itself never touches a socket; these framing helpers are a
//! convenience for hosts that carry the wire messages over a byte stream.

use std::io::{ErrorKind, Read, Write};

use crate::{error::NetError, protocol::messages::ProtocolMessage};

/// Upper bound on a single framed wire message. A full piece plus its
/// envelope never comes close to this in practice.
pub const MAX_WIRE_MESSAGE_LEN: u32 = 4 * 1024 * 1024;

/// Serialize and write a single length-framed message.
pub fn send_message(
    writer: &mut impl Write,
    message: &impl serde::Serialize,
) -> Result<(), NetError> {
    let message_bytes = serde_cbor::to_vec(message)?;
    writer.write_all(&(message_bytes.len() as u32).to_be_bytes())?;
    writer.write_all(&message_bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a single length-framed [ProtocolMessage].
pub fn read_message(reader: &mut impl Read) -> Result<ProtocolMessage, NetError> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            NetError::ReachedEOF
        } else {
            NetError::IO(e)
        }
    })?;
    let length = u32::from_be_bytes(length_bytes);
    if length > MAX_WIRE_MESSAGE_LEN {
        return Err(NetError::MessageTooLong(length));
    }
    let mut buffer = vec![0u8; length as usize];
    reader.read_exact(&mut buffer)?;
    let message: ProtocolMessage = serde_cbor::from_slice(&buffer)?;
    log::debug!("<== {}", message);
    Ok(message)
}
