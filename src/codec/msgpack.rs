//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written as maps keyed by field name unless the codec is built
//! with [`MsgPackCodec::compact`], which writes them as positional arrays
//! (the layout of integer-keyed contracts on the server side).

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::HubCodec;
use crate::error::Result;

/// MessagePack codec for structured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgPackCodec {
    struct_map: bool,
}

impl MsgPackCodec {
    /// Codec writing structs as maps (with field names).
    pub const fn named() -> Self {
        Self { struct_map: true }
    }

    /// Codec writing structs as arrays (positional).
    pub const fn compact() -> Self {
        Self { struct_map: false }
    }

    /// Whether structs are written as maps.
    #[inline]
    pub fn writes_struct_map(&self) -> bool {
        self.struct_map
    }
}

impl Default for MsgPackCodec {
    fn default() -> Self {
        Self::named()
    }
}

impl HubCodec for MsgPackCodec {
    #[inline]
    fn encode_into<T: Serialize + ?Sized>(&self, value: &T, buf: &mut Vec<u8>) -> Result<()> {
        if self.struct_map {
            rmp_serde::encode::write_named(buf, value)?;
        } else {
            rmp_serde::encode::write(buf, value)?;
        }
        Ok(())
    }

    #[inline]
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let codec = MsgPackCodec::default();
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = codec.encode(&original).unwrap();
        let decoded: TestStruct = codec.decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_named_produces_map_format() {
        let encoded = MsgPackCodec::named()
            .encode(&TestStruct {
                id: 1,
                name: "x".to_string(),
                active: false,
            })
            .unwrap();

        // 0x83 = fixmap with 3 entries
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_compact_produces_array_format() {
        let codec = MsgPackCodec::compact();
        let original = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };
        let encoded = codec.encode(&original).unwrap();

        // 0x93 = fixarray with 3 elements
        assert_eq!(encoded[0], 0x93);
        let decoded: TestStruct = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_into_appends() {
        let codec = MsgPackCodec::default();
        let mut buf = vec![0x92, 0x01];
        codec.encode_into(&7i32, &mut buf).unwrap();
        assert_eq!(buf, vec![0x92, 0x01, 0x07]);
    }

    #[test]
    fn test_unit_encodes_as_nil() {
        let encoded = MsgPackCodec::default().encode(&()).unwrap();
        assert_eq!(encoded, vec![0xc0]);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<TestStruct> = MsgPackCodec::default().decode(b"not valid msgpack");
        assert!(result.is_err());
    }

    #[test]
    fn test_binary_buffer() {
        let codec = MsgPackCodec::default();
        let data: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let encoded = codec.encode(&serde_bytes::Bytes::new(&data)).unwrap();

        // bin8
        assert_eq!(encoded[0], 0xc4);

        let decoded: serde_bytes::ByteBuf = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data);
    }
}
