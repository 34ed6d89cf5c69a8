//! Self-describing CBOR envelope for packets.
//!
//! Wire format: one CBOR map `{ "type_url": text, "value": bytes }` per
//! WebSocket binary message, where `value` is the CBOR encoding of the packet
//! itself. Decoding is two-phase: [`decode`] yields the envelope and its type
//! name without knowing the packet type, and [`Envelope::unpack`] performs the
//! typed decode once the caller has picked the concrete type.

use crate::error::{VerniteError, VerniteResult};
use crate::packets::Packet;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Prefix put in front of the type name when packing.
pub const TYPE_URL_PREFIX: &str = "/";

/// A packed packet: type identity plus the still-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_url: String,
    #[serde(with = "raw_bytes")]
    pub value: Vec<u8>,
}

impl Envelope {
    /// Pack a packet, embedding its own type name.
    pub fn pack<P: Packet>(packet: &P) -> VerniteResult<Self> {
        Ok(Self {
            type_url: format!("{TYPE_URL_PREFIX}{}", P::TYPE_NAME),
            value: cbor_encode(packet)?,
        })
    }

    /// The type name: everything after the last `/` of the type URL, or an
    /// empty string when the URL has no `/`.
    pub fn type_name(&self) -> &str {
        match self.type_url.rfind('/') {
            Some(pos) => &self.type_url[pos + 1..],
            None => "",
        }
    }

    /// Whether this envelope carries a `P`.
    pub fn is<P: Packet>(&self) -> bool {
        self.type_name() == P::TYPE_NAME
    }

    /// Decode the payload as `P`. Fails if the envelope carries another type.
    pub fn unpack<P: Packet>(&self) -> VerniteResult<P> {
        if !self.is::<P>() {
            return Err(VerniteError::InvalidMessage(format!(
                "envelope holds {}, not {}",
                self.type_name(),
                P::TYPE_NAME
            )));
        }
        cbor_decode(&self.value)
    }
}

/// Pack and serialize a packet into one frame.
pub fn encode<P: Packet>(packet: &P) -> VerniteResult<Vec<u8>> {
    cbor_encode(&Envelope::pack(packet)?)
}

/// Parse the outer envelope of a frame. The payload stays undecoded.
pub fn decode(frame: &[u8]) -> VerniteResult<Envelope> {
    cbor_decode(frame)
}

/// Serialize any value as CBOR.
pub fn cbor_encode<T: Serialize + ?Sized>(value: &T) -> VerniteResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> VerniteResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Keeps the payload a CBOR byte string instead of an array of integers.
mod raw_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        // Lenient: some encoders emit byte arrays as plain integer arrays.
        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}
