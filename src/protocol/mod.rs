//! Wire protocol: binary frames carrying JSON event payloads
//!
//! - `frame`: length-prefixed frame format and streaming codec
//! - `events`: typed event payloads and core data model
//! - `codec`: Encodable/Decodable bridge between the two

pub mod codec;
pub mod events;
pub mod frame;

pub use codec::{Decodable, Encodable};
pub use events::*;
pub use frame::{Frame, FrameCodec, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
