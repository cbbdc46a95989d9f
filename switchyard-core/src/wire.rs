//! Encoding: `i16` kind header + fields. Integers little-endian, strings are
//! u32 LE byte length + UTF-8, GUIDs are 16 bytes in mixed-endian layout.

use uuid::Uuid;

use crate::protocol::{Message, StartStatus};

/// Largest string (URL or error message) accepted on the wire.
pub const MAX_STRING_LEN: u32 = 64 * 1024;

/// Encode a message into the bytes of one logical frame.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = Vec::with_capacity(64);
    put_i16(&mut out, msg.kind().as_i16());
    match msg {
        Message::ServiceProvideServer { url }
        | Message::TaskProvideServer { url }
        | Message::ClientRequestServer { url } => put_string(&mut out, url)?,
        Message::ServiceRequestServer { url, guid } => {
            put_string(&mut out, url)?;
            put_guid(&mut out, guid);
        }
        Message::ClientServerStarted { status } => put_status(&mut out, status)?,
        Message::ServerStarted { guid, status } => {
            put_guid(&mut out, guid);
            put_status(&mut out, status)?;
        }
    }
    Ok(out)
}

/// Error encoding a message (string over the wire limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("string of {0} bytes exceeds wire limit")]
    StringTooLong(usize),
}

pub fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_guid(out: &mut Vec<u8>, guid: &Uuid) {
    out.extend_from_slice(&guid.to_bytes_le());
}

pub fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), FrameEncodeError> {
    let len = s.len();
    if len > MAX_STRING_LEN as usize {
        return Err(FrameEncodeError::StringTooLong(len));
    }
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_status(out: &mut Vec<u8>, status: &StartStatus) -> Result<(), FrameEncodeError> {
    put_i32(out, status.code());
    if let StartStatus::Failed { message, .. } = status {
        put_string(out, message)?;
    }
    Ok(())
}
