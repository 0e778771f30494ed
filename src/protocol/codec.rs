//! Codec for encoding/decoding protocol events to/from frames
//!
//! This module provides the bridge between typed event payloads and binary
//! frames.

use super::events::*;
use super::frame::{Frame, FrameType};
use bytes::Bytes;
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for events that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this event
    fn frame_type(&self) -> FrameType;

    /// Encode the event payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for events that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this event
    fn expected_frame_type() -> FrameType;

    /// Decode the event from a payload
    fn decode_payload(payload: &[u8]) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.frame_type != Self::expected_frame_type() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame type {:?}, got {:?}",
                    Self::expected_frame_type(),
                    frame.frame_type
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Helper macro to implement Encodable and Decodable for an event type
macro_rules! impl_codec {
    ($type:ty, $frame_type:expr) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                $frame_type
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                $frame_type
            }

            fn decode_payload(payload: &[u8]) -> io::Result<Self> {
                serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }
    };
}

// Control events
impl_codec!(Hello, FrameType::Hello);
impl_codec!(Me, FrameType::Me);
impl_codec!(AuthFailed, FrameType::AuthFailed);
impl_codec!(Goodbye, FrameType::Goodbye);

// Client -> Server requests
impl_codec!(JoinRoom, FrameType::JoinRoom);
impl_codec!(DmInitiate, FrameType::DmInitiate);
impl_codec!(SendMessage, FrameType::SendMessage);

// Server -> Client events
impl_codec!(RoomHistory, FrameType::RoomHistory);
impl_codec!(MessageNew, FrameType::MessageNew);
impl_codec!(MessageError, FrameType::MessageError);
impl_codec!(PresenceUpdate, FrameType::PresenceUpdate);
impl_codec!(DmInvited, FrameType::DmInvited);

// Error event
impl_codec!(Error, FrameType::Error);
