//! # remoting-protocol
//!
//! Wire protocol implementation for remoting.
//!
//! This crate provides:
//! - A growable byte buffer with separate read/write cursors
//! - Body serializers indexed by a 5-bit id
//! - The fixed 16-byte header frame codec for requests, responses and heartbeats
//! - Protocol error types

pub mod buffer;
pub mod codec;
pub mod error;
pub mod serializer;

pub use buffer::ByteBuffer;
pub use codec::{Codec, Decoded, FrameDecoder, HEADER_LENGTH, MAGIC, STATUS_ERROR, STATUS_OK};
pub use error::{ProtocolError, SerializationError};
pub use serializer::{
    CborSerializer, JsonSerializer, ObjectInput, ObjectOutput, Serializer, SerializerRegistry,
    CBOR_SERIALIZER_ID, JSON_SERIALIZER_ID,
};

/// Default port for remoting servers.
pub const DEFAULT_PORT: u16 = 8700;

/// Maximum frame body size (16 MiB).
pub const MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;
