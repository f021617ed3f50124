//! Frame codec.
//!
//! Frame format:
//! ```text
//! +--------+------+--------+------------+-------------+--------+
//! | Magic  | Flag | Status | Message ID | Body Length |  Body  |
//! | 2 bytes| 1 B  | 1 B    | 8 bytes    | 4 bytes     |  var   |
//! +--------+------+--------+------------+-------------+--------+
//! ```
//!
//! All integers are big-endian. The flag byte carries the request, two-way
//! and event bits plus the 5-bit serializer id. Heartbeats have an empty body.

use crate::buffer::ByteBuffer;
use crate::error::{ProtocolError, SerializationError};
use crate::serializer::{ObjectInput, ObjectOutput, SerializerRegistry, MAX_SERIALIZER_ID};
use crate::MAX_BODY_SIZE;
use remoting_core::{HeartbeatMessage, Invoke, InvokeResult, Message};
use std::sync::Arc;

/// Magic bytes opening every frame.
pub const MAGIC: u16 = 0xBABE;

/// Fixed header size in bytes.
pub const HEADER_LENGTH: usize = 16;

pub const FLAG_REQUEST: u8 = 0x80;
pub const FLAG_TWO_WAY: u8 = 0x40;
pub const FLAG_EVENT: u8 = 0x20;
pub const SERIALIZER_MASK: u8 = 0x1f;

pub const STATUS_OK: u8 = 20;
pub const STATUS_ERROR: u8 = 50;

/// Result type name sent when a response carries no value.
pub const NULL_RESULT: &str = "NULL";

/// Outcome of one decode attempt.
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame was consumed.
    Message(Message),
    /// Not enough bytes; the reader cursor is unchanged.
    NeedMore,
    /// The bytes do not start with [`MAGIC`]; the reader cursor is unchanged.
    Foreign,
}

/// Encodes and decodes frames using a fixed serializer set.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    serializers: Arc<SerializerRegistry>,
}

impl Codec {
    pub fn new(serializers: Arc<SerializerRegistry>) -> Self {
        Self { serializers }
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    /// Appends one frame to `buf`. On failure the writer cursor is restored
    /// so no partial frame is left behind.
    pub fn encode(&self, msg: &Message, buf: &mut ByteBuffer) -> Result<(), ProtocolError> {
        let start = buf.writer_index();
        if let Err(e) = self.encode_frame(msg, buf) {
            buf.set_writer_index(start)?;
            return Err(e);
        }
        Ok(())
    }

    /// Encodes one frame into a fresh buffer.
    pub fn encode_to_buffer(&self, msg: &Message) -> Result<ByteBuffer, ProtocolError> {
        let mut buf = ByteBuffer::new();
        self.encode(msg, &mut buf)?;
        Ok(buf)
    }

    fn encode_frame(&self, msg: &Message, buf: &mut ByteBuffer) -> Result<(), ProtocolError> {
        let id = msg.id();
        let serializer_id = msg.serializer_id();
        if serializer_id > MAX_SERIALIZER_ID {
            return Err(ProtocolError::InvalidSerializerId(serializer_id));
        }

        let mut flag = serializer_id;
        if matches!(msg, Message::Invoke(_)) {
            flag |= FLAG_REQUEST;
        }
        if msg.is_two_way() {
            flag |= FLAG_TWO_WAY;
        }
        if msg.is_heartbeat() {
            flag |= FLAG_EVENT;
        }
        let status = match msg {
            Message::Result(r) if r.is_error() => STATUS_ERROR,
            _ => STATUS_OK,
        };

        buf.write_u16(MAGIC);
        buf.write_u8(flag);
        buf.write_u8(status);
        buf.write_i64(id);
        let body_length_offset = buf.writer_index();
        buf.write_i32(0);

        if msg.is_heartbeat() {
            return Ok(());
        }

        let serializer = self
            .serializers
            .get(serializer_id)
            .ok_or(ProtocolError::UnknownSerializer { id, serializer_id })?;
        {
            let mut out = serializer.output(buf);
            let written = match msg {
                Message::Invoke(invoke) => write_request(invoke, out.as_mut()),
                Message::Result(result) => write_response(result, out.as_mut()),
                Message::Heartbeat(_) => Ok(()),
            };
            written.map_err(|source| ProtocolError::Encode { id, source })?;
        }

        let end = buf.writer_index();
        let body_length = end - (body_length_offset + 4);
        if body_length > MAX_BODY_SIZE as usize {
            return Err(ProtocolError::InvalidBodyLength {
                id,
                length: body_length as i64,
                max: MAX_BODY_SIZE,
            });
        }
        buf.set_writer_index(body_length_offset)?;
        buf.write_i32(body_length as i32);
        buf.set_writer_index(end)?;

        tracing::trace!(id, flag, status, body_length, "Encoded frame");
        Ok(())
    }

    /// Decodes at most one frame from the readable bytes of `buf`.
    ///
    /// Exactly `HEADER_LENGTH + BODY_LENGTH` bytes are consumed for a decoded
    /// frame, including one whose body fails to deserialize.
    pub fn decode(&self, buf: &mut ByteBuffer) -> Result<Decoded, ProtocolError> {
        if buf.readable_bytes() < HEADER_LENGTH {
            return Ok(Decoded::NeedMore);
        }

        buf.mark_reader();
        let magic = buf.read_u16()?;
        if magic != MAGIC {
            buf.reset_reader();
            return Ok(Decoded::Foreign);
        }
        let flag = buf.read_u8()?;
        let status = buf.read_u8()?;
        let id = buf.read_i64()?;
        let body_length = buf.read_i32()?;

        if body_length < 0 || body_length as u32 > MAX_BODY_SIZE {
            buf.reset_reader();
            return Err(ProtocolError::InvalidBodyLength {
                id,
                length: body_length as i64,
                max: MAX_BODY_SIZE,
            });
        }
        let body_length = body_length as usize;
        if buf.readable_bytes() < body_length {
            buf.reset_reader();
            return Ok(Decoded::NeedMore);
        }

        let two_way = flag & FLAG_TWO_WAY != 0;
        if flag & FLAG_EVENT != 0 {
            buf.skip(body_length)?;
            let heartbeat = if two_way {
                HeartbeatMessage::ping(id)
            } else {
                HeartbeatMessage::pong(id)
            };
            tracing::trace!(id, two_way, "Decoded heartbeat");
            return Ok(Decoded::Message(heartbeat.into()));
        }

        let decoded = self.decode_body(flag, status, id, &buf.readable()[..body_length]);
        buf.skip(body_length)?;
        decoded.map(Decoded::Message)
    }

    fn decode_body(
        &self,
        flag: u8,
        status: u8,
        id: i64,
        body: &[u8],
    ) -> Result<Message, ProtocolError> {
        let serializer_id = flag & SERIALIZER_MASK;
        let serializer = self
            .serializers
            .get(serializer_id)
            .ok_or(ProtocolError::UnknownSerializer { id, serializer_id })?;
        let mut input = serializer.input(body);

        let message = if status != STATUS_OK {
            read_error(input.as_mut()).map(|message| {
                InvokeResult::error(id, message)
                    .with_serializer(serializer_id)
                    .into()
            })
        } else if flag & FLAG_REQUEST != 0 {
            read_request(input.as_mut()).map(|invoke| {
                let mut invoke = invoke.with_id(id).with_serializer(serializer_id);
                invoke.two_way = flag & FLAG_TWO_WAY != 0;
                invoke.into()
            })
        } else {
            read_response(input.as_mut()).map(|value| {
                InvokeResult::ok(id, value)
                    .with_serializer(serializer_id)
                    .into()
            })
        };
        message.map_err(|source| ProtocolError::Decode { id, source })
    }
}

fn write_request(invoke: &Invoke, out: &mut dyn ObjectOutput) -> Result<(), SerializationError> {
    let args = invoke.args();
    let types = invoke.parameter_type_names();
    if args.len() != types.len() {
        return Err(SerializationError::ArgumentMismatch {
            args: args.len(),
            types: types.len(),
        });
    }
    out.write_string(invoke.interface_name())?;
    out.write_string(invoke.version())?;
    out.write_string(invoke.method_name())?;
    out.write_i32(args.len() as i32)?;
    for (ty, arg) in types.iter().zip(args) {
        out.write_string(ty)?;
        out.write_object(arg)?;
    }
    Ok(())
}

fn write_response(
    result: &InvokeResult,
    out: &mut dyn ObjectOutput,
) -> Result<(), SerializationError> {
    if let Some(message) = result.error_message() {
        return out.write_string(message);
    }
    match (result.value(), result.result_type_name()) {
        (Some(value), Some(type_name)) => {
            out.write_string(type_name)?;
            out.write_object(value)
        }
        _ => out.write_string(NULL_RESULT),
    }
}

fn read_error(input: &mut dyn ObjectInput) -> Result<String, SerializationError> {
    input.read_string()
}

fn read_request(input: &mut dyn ObjectInput) -> Result<Invoke, SerializationError> {
    let interface_name = input.read_string()?;
    let version = input.read_string()?;
    let method_name = input.read_string()?;
    let args_length = input.read_i32()?;
    if args_length < 0 {
        return Err(SerializationError::NegativeLength(args_length));
    }

    let mut type_names = Vec::with_capacity(args_length.min(64) as usize);
    let mut args = Vec::with_capacity(args_length.min(64) as usize);
    for _ in 0..args_length {
        let type_name = input.read_string()?;
        args.push(input.read_object(&type_name)?);
        type_names.push(type_name);
    }
    Ok(Invoke::decoded(
        interface_name,
        version,
        method_name,
        args,
        type_names,
    ))
}

fn read_response(
    input: &mut dyn ObjectInput,
) -> Result<Option<serde_json::Value>, SerializationError> {
    let type_name = input.read_string()?;
    if type_name == NULL_RESULT {
        return Ok(None);
    }
    input.read_object(&type_name).map(Some)
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: Codec,
    buffer: ByteBuffer,
}

impl FrameDecoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            buffer: ByteBuffer::with_capacity(8192),
        }
    }

    /// Appends data read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.write_bytes(data);
    }

    /// Decodes the next frame. Foreign bytes are discarded with a warning.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let decoded = self.codec.decode(&mut self.buffer);
        let result = match decoded {
            Ok(Decoded::Message(msg)) => Ok(Some(msg)),
            Ok(Decoded::NeedMore) => Ok(None),
            Ok(Decoded::Foreign) => {
                tracing::warn!(
                    discarded = self.buffer.readable_bytes(),
                    "Discarding bytes that are not a remoting frame"
                );
                self.buffer.clear();
                Ok(None)
            }
            Err(e) => Err(e),
        };
        self.buffer.discard_read_bytes();
        result
    }

    /// Returns the number of buffered, undecoded bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.readable_bytes()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
