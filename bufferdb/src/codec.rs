//! Byte encoding for keys and values written to partition logs.
//!
//! The partition store is generic over its key and value types. Anything that
//! goes into a log record implements [`Codec`], which turns the value into a
//! self-contained byte string and back. The log framing (lengths, checksum)
//! lives in `storage::record`; a codec only ever sees the payload bytes of one
//! field.
//!
//! Encodings must be injective: two keys are treated as equal on disk when
//! their encoded bytes are equal.

/// Conversion between an in-memory value and its on-disk bytes.
pub trait Codec: Sized {
    /// Append the encoded form of `self` to `out`.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decode a value from exactly the bytes produced by [`Codec::encode`].
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    /// Encode into a fresh buffer.
    #[must_use]
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl Codec for String {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

macro_rules! fixed_width_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Codec for $ty {
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
                    let array: [u8; size_of::<$ty>()] =
                        bytes.try_into().map_err(|_| CodecError::WrongLength {
                            expected: size_of::<$ty>(),
                            actual: bytes.len(),
                        })?;
                    Ok(<$ty>::from_le_bytes(array))
                }
            }
        )*
    };
}

fixed_width_codec!(u32, u64, i32, i64);

/// Errors that can occur while decoding a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// String bytes were not valid UTF-8.
    InvalidUtf8,
    /// A fixed-width field had the wrong number of bytes.
    WrongLength { expected: usize, actual: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::WrongLength { expected, actual } => {
                write!(f, "wrong field length: expected {expected} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_codec() {
        let value = "partition".to_string();
        assert_eq!(value.to_bytes(), b"partition".to_vec());
        assert_eq!(String::decode(b"partition"), Ok(value));
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        assert_eq!(String::decode(&[0xff, 0xfe]), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_integer_codec_is_little_endian() {
        assert_eq!(0x0102_0304u32.to_bytes(), vec![4, 3, 2, 1]);
        assert_eq!(i64::decode(&(-7i64).to_le_bytes()), Ok(-7));
    }

    #[test]
    fn test_integer_codec_wrong_length() {
        assert_eq!(
            u64::decode(&[1, 2, 3]),
            Err(CodecError::WrongLength {
                expected: 8,
                actual: 3
            })
        );
    }

    #[test]
    fn test_bytes_codec_passthrough() {
        let value = vec![0u8, 1, 2, 255];
        assert_eq!(Vec::<u8>::decode(&value.to_bytes()), Ok(value));
    }

    #[test]
    fn test_codec_error_display() {
        let e = CodecError::WrongLength {
            expected: 8,
            actual: 2,
        };
        assert!(e.to_string().contains("expected 8 bytes"));
    }
}
