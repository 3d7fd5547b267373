//! CTAPHID framing for FIDO security keys
//!
//! Messages travel as a sequence of fixed 64-byte HID reports. The first
//! report of a message is an *initialization* frame, any remaining payload
//! follows in *continuation* frames:
//!
//! ```text
//! init:          | CID (4, BE) | CMD|0x80 (1) | BCNT (2, BE) | DATA (57)  |
//! continuation:  | CID (4, BE) | SEQ 0..0x7F (1)             | DATA (59)  |
//! ```
//!
//! Only the framing is implemented here; what the payloads mean is up to the
//! command layer.

use std::fmt;

use tracing::debug;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::TransportError;
use crate::types::Report;

/// HID report size for FIDO keys (report ID 0 is not counted)
pub const REPORT_SIZE: usize = 64;

/// Initialization frame header: CID + CMD + BCNTH + BCNTL
pub const INIT_HEADER_SIZE: usize = 7;

/// Continuation frame header: CID + SEQ
pub const CONT_HEADER_SIZE: usize = 5;

/// Payload bytes carried by an initialization frame
pub const INIT_PAYLOAD_SIZE: usize = REPORT_SIZE - INIT_HEADER_SIZE;

/// Payload bytes carried by a continuation frame
pub const CONT_PAYLOAD_SIZE: usize = REPORT_SIZE - CONT_HEADER_SIZE;

/// Continuation sequence numbers must stay below this value
pub const MAX_SEQUENCE: usize = 0x80;

/// Largest message that fits one init frame plus 128 continuation frames
pub const MAX_MESSAGE_SIZE: usize = MAX_SEQUENCE * CONT_PAYLOAD_SIZE + INIT_PAYLOAD_SIZE;

/// Bit 7 of byte 4 marks an initialization frame
pub const TYPE_INIT: u8 = 0x80;

/// Size of the nonce sent with CTAPHID_INIT
pub const INIT_NONCE_SIZE: usize = 8;

/// CTAPHID command identifiers (without the TYPE_INIT bit)
pub mod cmd {
    /// Echo the payload back
    pub const PING: u8 = 0x01;
    /// Encapsulated CTAP1/U2F message
    pub const MSG: u8 = 0x03;
    /// Exclusive channel lock
    pub const LOCK: u8 = 0x04;
    /// Allocate a channel
    pub const INIT: u8 = 0x06;
    /// Visual/audible identification
    pub const WINK: u8 = 0x08;
    /// Encapsulated CTAP2 CBOR message
    pub const CBOR: u8 = 0x10;
    /// Cancel outstanding request on the channel
    pub const CANCEL: u8 = 0x11;
    /// Request still being processed (user presence pending)
    pub const KEEPALIVE: u8 = 0x3B;
    /// Error response, payload byte 0 is the status code
    pub const ERROR: u8 = 0x3F;
    /// Vendor extension: load a seed and extension state into the key
    pub const LOADKEY: u8 = 0x62;

    /// Get human-readable name for command byte
    pub fn name(cmd: u8) -> &'static str {
        match cmd & 0x7F {
            PING => "PING",
            MSG => "MSG",
            LOCK => "LOCK",
            INIT => "INIT",
            WINK => "WINK",
            CBOR => "CBOR",
            CANCEL => "CANCEL",
            KEEPALIVE => "KEEPALIVE",
            ERROR => "ERROR",
            LOADKEY => "LOADKEY",
            _ => "UNKNOWN",
        }
    }
}

/// Capability flags reported in the INIT response
pub mod capability {
    /// Implements CTAPHID_WINK
    pub const WINK: u8 = 0x01;
    /// Implements CTAPHID_CBOR
    pub const CBOR: u8 = 0x04;
    /// Does NOT implement CTAPHID_MSG
    pub const NMSG: u8 = 0x08;
}

/// CTAPHID channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel(pub u32);

impl Channel {
    /// Reserved channel used only for the INIT handshake
    pub const BROADCAST: Channel = Channel(0xFFFF_FFFF);

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl From<u32> for Channel {
    fn from(cid: u32) -> Self {
        Channel(cid)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct InitHeader {
    cid: U32,
    cmd: u8,
    bcnt: U16,
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ContHeader {
    cid: U32,
    seq: u8,
}

/// Number of frames `encode` produces for a payload of `len` bytes
pub fn frame_count(len: usize) -> usize {
    let rest = len.saturating_sub(INIT_PAYLOAD_SIZE);
    1 + rest.div_ceil(CONT_PAYLOAD_SIZE)
}

/// Split a logical message into HID reports.
///
/// The command's top bit is forced set in the initialization frame. Unused
/// bytes of the last frame stay zero. Payloads larger than
/// [`MAX_MESSAGE_SIZE`] are rejected rather than truncated.
pub fn encode(channel: Channel, command: u8, payload: &[u8]) -> Result<Vec<Report>, TransportError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frames = Vec::with_capacity(frame_count(payload.len()));
    let cid = U32::new(channel.0);

    let (first, rest) = payload.split_at(payload.len().min(INIT_PAYLOAD_SIZE));
    let mut init = [0u8; REPORT_SIZE];
    let header = InitHeader {
        cid,
        cmd: command | TYPE_INIT,
        bcnt: U16::new(payload.len() as u16),
    };
    init[..INIT_HEADER_SIZE].copy_from_slice(header.as_bytes());
    init[INIT_HEADER_SIZE..INIT_HEADER_SIZE + first.len()].copy_from_slice(first);
    frames.push(init);

    // MAX_MESSAGE_SIZE keeps seq below MAX_SEQUENCE
    for (seq, chunk) in rest.chunks(CONT_PAYLOAD_SIZE).enumerate() {
        let mut cont = [0u8; REPORT_SIZE];
        let header = ContHeader {
            cid,
            seq: seq as u8,
        };
        cont[..CONT_HEADER_SIZE].copy_from_slice(header.as_bytes());
        cont[CONT_HEADER_SIZE..CONT_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        frames.push(cont);
    }

    Ok(frames)
}

/// One received report, split into header fields and message bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub channel: Channel,
    pub is_initialization: bool,
    /// Low 7 bits of byte 4: the command for init frames, the sequence
    /// number for continuation frames
    pub command: u8,
    /// BCNT for init frames, `64 - header` for continuation frames
    pub declared_length: usize,
    /// Everything after the header, padding included
    pub message: &'a [u8],
}

impl DecodedFrame<'_> {
    pub fn header_size(&self) -> usize {
        if self.is_initialization {
            INIT_HEADER_SIZE
        } else {
            CONT_HEADER_SIZE
        }
    }

    /// Message bytes trimmed to the declared length
    pub fn payload(&self) -> &[u8] {
        &self.message[..self.declared_length.min(self.message.len())]
    }
}

/// Decode the header of a single report. Does not reassemble.
pub fn decode(frame: &Report) -> DecodedFrame<'_> {
    let channel = Channel(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]));
    let is_initialization = frame[4] & TYPE_INIT != 0;
    let command = frame[4] & 0x7F;

    if is_initialization {
        DecodedFrame {
            channel,
            is_initialization,
            command,
            declared_length: u16::from_be_bytes([frame[5], frame[6]]) as usize,
            message: &frame[INIT_HEADER_SIZE..],
        }
    } else {
        DecodedFrame {
            channel,
            is_initialization,
            command,
            declared_length: REPORT_SIZE - CONT_HEADER_SIZE,
            message: &frame[CONT_HEADER_SIZE..],
        }
    }
}

/// A complete, reassembled CTAPHID message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Channel,
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct PendingMessage {
    channel: Channel,
    command: u8,
    declared: usize,
    payload: Vec<u8>,
    next_seq: u8,
}

/// Reassembles inbound frames into messages.
///
/// An init frame always starts a new message (abandoning a partial one);
/// continuation frames must carry the same channel and the next sequence
/// number. Any violation resets the assembler and returns an error.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: Option<PendingMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no partial message is buffered
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Feed one decoded frame; returns the message once all bytes arrived.
    pub fn push(&mut self, frame: &DecodedFrame<'_>) -> Result<Option<Message>, TransportError> {
        if frame.is_initialization {
            if let Some(abandoned) = self.pending.take() {
                debug!(
                    "Abandoning partial {} message on channel {} ({}/{} bytes)",
                    cmd::name(abandoned.command),
                    abandoned.channel,
                    abandoned.payload.len(),
                    abandoned.declared
                );
            }
            if frame.declared_length > MAX_MESSAGE_SIZE {
                return Err(TransportError::InvalidFrame(format!(
                    "declared length {} exceeds {}",
                    frame.declared_length, MAX_MESSAGE_SIZE
                )));
            }
            let pending = PendingMessage {
                channel: frame.channel,
                command: frame.command,
                declared: frame.declared_length,
                payload: frame.payload().to_vec(),
                next_seq: 0,
            };
            return Ok(self.complete_or_store(pending));
        }

        let Some(mut pending) = self.pending.take() else {
            return Err(TransportError::InvalidFrame(format!(
                "continuation seq {} on channel {} without initialization frame",
                frame.command, frame.channel
            )));
        };
        if frame.channel != pending.channel {
            return Err(TransportError::InvalidFrame(format!(
                "continuation on channel {} interleaved with message on {}",
                frame.channel, pending.channel
            )));
        }
        if frame.command != pending.next_seq {
            return Err(TransportError::InvalidFrame(format!(
                "expected sequence {}, got {}",
                pending.next_seq, frame.command
            )));
        }

        let remaining = pending.declared - pending.payload.len();
        let take = remaining.min(frame.message.len());
        pending.payload.extend_from_slice(&frame.message[..take]);
        pending.next_seq += 1;
        Ok(self.complete_or_store(pending))
    }

    fn complete_or_store(&mut self, pending: PendingMessage) -> Option<Message> {
        if pending.payload.len() >= pending.declared {
            Some(Message {
                channel: pending.channel,
                command: pending.command,
                payload: pending.payload,
            })
        } else {
            self.pending = Some(pending);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct InitResponseBody {
    nonce: [u8; INIT_NONCE_SIZE],
    cid: U32,
    protocol_version: u8,
    major: u8,
    minor: u8,
    build: u8,
    capabilities: u8,
}

/// Decoded CTAPHID_INIT response body (17 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResponse {
    pub nonce: [u8; INIT_NONCE_SIZE],
    /// Channel allocated to the requester
    pub channel: Channel,
    pub protocol_version: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub build_version: u8,
    pub capabilities: u8,
}

impl InitResponse {
    /// Encoded size of the response body
    pub const SIZE: usize = std::mem::size_of::<InitResponseBody>();

    /// Parse the message body of an INIT response; `None` if it's too short.
    pub fn parse(message: &[u8]) -> Option<Self> {
        let (body, _) = InitResponseBody::read_from_prefix(message).ok()?;
        Some(Self {
            nonce: body.nonce,
            channel: Channel(body.cid.get()),
            protocol_version: body.protocol_version,
            major_version: body.major,
            minor_version: body.minor,
            build_version: body.build,
            capabilities: body.capabilities,
        })
    }

    /// Serialize back to the wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        InitResponseBody {
            nonce: self.nonce,
            cid: U32::new(self.channel.0),
            protocol_version: self.protocol_version,
            major: self.major_version,
            minor: self.minor_version,
            build: self.build_version,
            capabilities: self.capabilities,
        }
        .as_bytes()
        .to_vec()
    }

    pub fn supports_wink(&self) -> bool {
        self.capabilities & capability::WINK != 0
    }

    pub fn supports_cbor(&self) -> bool {
        self.capabilities & capability::CBOR != 0
    }

    /// Firmware version as `major.minor.build`
    pub fn device_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.major_version, self.minor_version, self.build_version
        )
    }
}
