//! Length-prefixed CBOR framing for the relay control channel.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`
//!
//! The decoder only trusts the length header, so payload bytes that look
//! like delimiters, or a unit split across any number of reads, never
//! change where a frame ends.

use crate::error::{ProxyError, ProxyResult};
use crate::messages::{ControlMessage, WireControl};
use std::io::Cursor;

/// Length of the frame header.
pub const HEADER_LEN: usize = 4;

/// Largest accepted frame payload (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> ProxyResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProxyError::Protocol(format!(
            "frame too large: {} bytes (max {})",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> ProxyResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode a control message as one wire unit.
pub fn encode_control(msg: &ControlMessage) -> ProxyResult<Vec<u8>> {
    frame_encode(&msg.to_wire())
}

/// Streaming frame decoder: accumulates bytes and yields complete units.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete raw frame, if one is buffered.
    ///
    /// Fails as soon as the header announces an oversized frame, without
    /// waiting for its body.
    pub fn next_frame(&mut self) -> ProxyResult<Option<Vec<u8>>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;

        if len > MAX_FRAME_SIZE {
            return Err(ProxyError::Protocol(format!(
                "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
            )));
        }

        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        Ok(Some(payload))
    }

    /// Pop and validate the next control message, if one is complete.
    pub fn next_control(&mut self) -> ProxyResult<Option<ControlMessage>> {
        match self.next_frame()? {
            Some(payload) => {
                let wire: WireControl = cbor_decode(&payload)?;
                ControlMessage::try_from(wire).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Take whatever follows the decoded units (early tunnel bytes).
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
