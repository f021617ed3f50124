//! Body serializers.
//!
//! A frame body is a sequence of primitive writes (`i32`, string, object)
//! produced by one serializer. The serializer id travels in the low five bits
//! of the header flag byte, so a [`SerializerRegistry`] has exactly 32 slots.
//! Slot 0 is reserved for bodiless frames.

use crate::buffer::ByteBuffer;
use crate::error::{ProtocolError, SerializationError};
use remoting_core::ValueType;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Highest serializer id that fits the flag byte.
pub const MAX_SERIALIZER_ID: u8 = 0x1f;

/// Id of [`JsonSerializer`].
pub const JSON_SERIALIZER_ID: u8 = 1;

/// Id of [`CborSerializer`].
pub const CBOR_SERIALIZER_ID: u8 = 2;

/// Writes primitives into a frame body.
pub trait ObjectOutput {
    fn write_i32(&mut self, value: i32) -> Result<(), SerializationError>;
    fn write_string(&mut self, value: &str) -> Result<(), SerializationError>;
    fn write_object(&mut self, value: &Value) -> Result<(), SerializationError>;
}

/// Reads primitives from a frame body.
pub trait ObjectInput {
    fn read_i32(&mut self) -> Result<i32, SerializationError>;
    fn read_string(&mut self) -> Result<String, SerializationError>;

    /// Reads one object and checks it against `declared_type`. Names that do
    /// not resolve to a known type accept any value.
    fn read_object(&mut self, declared_type: &str) -> Result<Value, SerializationError>;
}

/// A body encoding bound to a fixed id.
pub trait Serializer: Send + Sync {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn output<'a>(&self, buf: &'a mut ByteBuffer) -> Box<dyn ObjectOutput + 'a>;

    /// `body` is bounded to the frame's declared body length.
    fn input<'a>(&self, body: &'a [u8]) -> Box<dyn ObjectInput + 'a>;
}

fn conform(declared_type: &str, value: Value) -> Result<Value, SerializationError> {
    match ValueType::resolve(declared_type) {
        Some(ty) if !ty.accepts(&value) => Err(SerializationError::TypeMismatch {
            declared: declared_type.to_string(),
            actual: ValueType::of(&value).name(),
        }),
        _ => Ok(value),
    }
}

/// Serializer slots indexed by id.
#[derive(Clone)]
pub struct SerializerRegistry {
    slots: [Option<Arc<dyn Serializer>>; 32],
}

impl SerializerRegistry {
    /// Registry with every slot empty.
    pub fn empty() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Registry with the built-in JSON and CBOR serializers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.slots[JSON_SERIALIZER_ID as usize] = Some(Arc::new(JsonSerializer));
        registry.slots[CBOR_SERIALIZER_ID as usize] = Some(Arc::new(CborSerializer));
        registry
    }

    /// Builds a registry from an explicit serializer set.
    pub fn from_serializers(
        serializers: impl IntoIterator<Item = Arc<dyn Serializer>>,
    ) -> Result<Self, ProtocolError> {
        let mut registry = Self::empty();
        for serializer in serializers {
            registry.register(serializer)?;
        }
        Ok(registry)
    }

    /// Places a serializer in the slot named by its id, replacing any
    /// previous occupant.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) -> Result<(), ProtocolError> {
        let id = serializer.id();
        if id == 0 || id > MAX_SERIALIZER_ID {
            return Err(ProtocolError::InvalidSerializerId(id));
        }
        tracing::debug!(id, name = serializer.name(), "Registered serializer");
        self.slots[id as usize] = Some(serializer);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Option<&Arc<dyn Serializer>> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Ids of the occupied slots, ascending.
    pub fn ids(&self) -> Vec<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id as u8)
            .collect()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self
            .slots
            .iter()
            .flatten()
            .map(|s| (s.id(), s.name()))
            .collect();
        f.debug_struct("SerializerRegistry")
            .field("serializers", &names)
            .finish()
    }
}

/// Cursor over a bounded frame body.
struct BodyReader<'a> {
    body: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializationError> {
        if self.body.len() < n {
            return Err(SerializationError::Truncated {
                needed: n,
                available: self.body.len(),
            });
        }
        let (head, tail) = self.body.split_at(n);
        self.body = tail;
        Ok(head)
    }

    fn take_i32(&mut self) -> Result<i32, SerializationError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_prefixed(&mut self) -> Result<&'a [u8], SerializationError> {
        let len = self.take_i32()?;
        if len < 0 {
            return Err(SerializationError::NegativeLength(len));
        }
        self.take(len as usize)
    }
}

/// JSON documents behind 4-byte big-endian length prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> u8 {
        JSON_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn output<'a>(&self, buf: &'a mut ByteBuffer) -> Box<dyn ObjectOutput + 'a> {
        Box::new(JsonOutput { buf })
    }

    fn input<'a>(&self, body: &'a [u8]) -> Box<dyn ObjectInput + 'a> {
        Box::new(JsonInput {
            reader: BodyReader { body },
        })
    }
}

struct JsonOutput<'a> {
    buf: &'a mut ByteBuffer,
}

impl JsonOutput<'_> {
    fn write_prefixed(&mut self, bytes: &[u8]) {
        self.buf.write_i32(bytes.len() as i32);
        self.buf.write_bytes(bytes);
    }
}

impl ObjectOutput for JsonOutput<'_> {
    fn write_i32(&mut self, value: i32) -> Result<(), SerializationError> {
        self.buf.write_i32(value);
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<(), SerializationError> {
        self.write_prefixed(value.as_bytes());
        Ok(())
    }

    fn write_object(&mut self, value: &Value) -> Result<(), SerializationError> {
        let bytes = serde_json::to_vec(value)?;
        self.write_prefixed(&bytes);
        Ok(())
    }
}

struct JsonInput<'a> {
    reader: BodyReader<'a>,
}

impl ObjectInput for JsonInput<'_> {
    fn read_i32(&mut self) -> Result<i32, SerializationError> {
        self.reader.take_i32()
    }

    fn read_string(&mut self) -> Result<String, SerializationError> {
        let bytes = self.reader.take_prefixed()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SerializationError::InvalidUtf8)
    }

    fn read_object(&mut self, declared_type: &str) -> Result<Value, SerializationError> {
        let bytes = self.reader.take_prefixed()?;
        let value = serde_json::from_slice(bytes)?;
        conform(declared_type, value)
    }
}

/// Self-delimiting CBOR items, one per primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn id(&self) -> u8 {
        CBOR_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "cbor"
    }

    fn output<'a>(&self, buf: &'a mut ByteBuffer) -> Box<dyn ObjectOutput + 'a> {
        Box::new(CborOutput { buf })
    }

    fn input<'a>(&self, body: &'a [u8]) -> Box<dyn ObjectInput + 'a> {
        Box::new(CborInput { body })
    }
}

struct CborOutput<'a> {
    buf: &'a mut ByteBuffer,
}

impl CborOutput<'_> {
    fn put<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SerializationError> {
        ciborium::into_writer(value, &mut *self.buf)
            .map_err(|e| SerializationError::Cbor(e.to_string()))
    }
}

impl ObjectOutput for CborOutput<'_> {
    fn write_i32(&mut self, value: i32) -> Result<(), SerializationError> {
        self.put(&value)
    }

    fn write_string(&mut self, value: &str) -> Result<(), SerializationError> {
        self.put(value)
    }

    fn write_object(&mut self, value: &Value) -> Result<(), SerializationError> {
        self.put(value)
    }
}

struct CborInput<'a> {
    body: &'a [u8],
}

impl CborInput<'_> {
    fn take<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, SerializationError> {
        ciborium::from_reader(&mut self.body).map_err(|e| SerializationError::Cbor(e.to_string()))
    }
}

impl ObjectInput for CborInput<'_> {
    fn read_i32(&mut self) -> Result<i32, SerializationError> {
        self.take()
    }

    fn read_string(&mut self) -> Result<String, SerializationError> {
        self.take()
    }

    fn read_object(&mut self, declared_type: &str) -> Result<Value, SerializationError> {
        let value = self.take()?;
        conform(declared_type, value)
    }
}
