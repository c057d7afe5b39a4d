//! Frame codec for the outer datagram envelope
//!
//! Handles framing of LAN packets and splitting of datagrams that carry
//! several frames back to back.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use super::headers::{self, LAN_X_BUS};
use super::SubMessage;

/// Envelope overhead: length(2) + header(2) = 4 bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed X-BUS message: {0}")]
    MalformedSubMessage(String),

    #[error("X-BUS checksum mismatch: calculated {calculated:#04x}, received {received:#04x}")]
    ChecksumMismatch { calculated: u8, received: u8 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// One LAN frame: command header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 16-bit command id
    pub header: u16,
    /// Payload bytes following the header
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Frame without payload
    pub fn header_only(header: u16) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Frame tunneling an X-BUS sub-message
    pub fn xbus(message: &SubMessage) -> Self {
        Self::new(LAN_X_BUS, message.encode())
    }

    /// Value of the length field: envelope overhead plus payload
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode the frame into a buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u16_le(self.encoded_len() as u16);
        buf.put_u16_le(self.header);
        buf.put_slice(&self.payload);
    }

    /// Encode the frame into wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode exactly one frame; the declared length must match `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(CodecError::MalformedFrame(format!(
                "need at least {} bytes, got {}",
                FRAME_HEADER_SIZE,
                buf.len()
            )));
        }

        let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if declared != buf.len() {
            return Err(CodecError::MalformedFrame(format!(
                "declared length {} does not match {} available bytes",
                declared,
                buf.len()
            )));
        }

        let header = u16::from_le_bytes([buf[2], buf[3]]);
        Ok(Self::new(
            header,
            Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..]),
        ))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = headers::lan_name(self.header).unwrap_or("UNKNOWN");
        write!(f, "Frame(header={:#06x} [{}]", self.header, name)?;
        if self.header == LAN_X_BUS {
            if let Some(x) = self.payload.first() {
                let x_name = headers::x_name(*x).unwrap_or("UNKNOWN");
                write!(f, ", x_header={:#04x} [{}]", x, x_name)?;
            }
        }
        write!(f, ", data=")?;
        for (i, b) in self.payload.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Iterator over the frames packed into one datagram
///
/// A length field that is too small or overruns the datagram ends the walk
/// with an error; the remaining bytes cannot be re-synchronised.
pub struct DatagramFrames<'a> {
    remaining: &'a [u8],
    failed: bool,
}

/// Split a datagram into its frames
pub fn split_datagram(datagram: &[u8]) -> DatagramFrames<'_> {
    DatagramFrames {
        remaining: datagram,
        failed: false,
    }
}

impl<'a> Iterator for DatagramFrames<'a> {
    type Item = Result<Frame, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }

        if self.remaining.len() < FRAME_HEADER_SIZE {
            self.failed = true;
            return Some(Err(CodecError::MalformedFrame(format!(
                "truncated frame of {} bytes",
                self.remaining.len()
            ))));
        }

        let declared = u16::from_le_bytes([self.remaining[0], self.remaining[1]]) as usize;
        if declared < FRAME_HEADER_SIZE || declared > self.remaining.len() {
            self.failed = true;
            return Some(Err(CodecError::MalformedFrame(format!(
                "declared length {} with {} bytes remaining",
                declared,
                self.remaining.len()
            ))));
        }

        let (chunk, rest) = self.remaining.split_at(declared);
        self.remaining = rest;
        Some(Frame::decode(chunk))
    }
}

/// A decoded inbound frame together with its tunneled sub-message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub frame: Frame,
    /// Present for every `LAN_X_BUS` frame
    pub xbus: Option<SubMessage>,
}

impl Packet {
    /// Decode the sub-message layer of a frame
    ///
    /// `LAN_X_BUS` frames always go through `SubMessage::decode`, and its
    /// errors are returned unchanged.
    pub fn decode(frame: Frame) -> Result<Self, CodecError> {
        let xbus = if frame.header == LAN_X_BUS {
            Some(SubMessage::decode(&frame.payload)?)
        } else {
            None
        };
        Ok(Self { frame, xbus })
    }

    pub fn header(&self) -> u16 {
        self.frame.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame.payload
    }
}
