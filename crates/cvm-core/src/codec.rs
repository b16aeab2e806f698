//! CBOR encoding for envelopes.
//!
//! Every WebSocket binary frame carries exactly one CBOR-encoded value, so
//! no length prefix is needed: the transport already delimits messages.

use crate::error::CvmResult;
use std::io::Cursor;

/// Encode a serializable value into a CBOR byte buffer.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> CvmResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> CvmResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CvmError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn round_trip() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let bytes = cbor_encode(&msg).unwrap();
        let decoded: TestMsg = cbor_decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_input_is_codec_error() {
        let msg = TestMsg {
            name: "truncate me".into(),
            value: 7,
        };
        let bytes = cbor_encode(&msg).unwrap();
        let err = cbor_decode::<TestMsg>(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, CvmError::Codec(_)));
    }

    #[test]
    fn empty_input_is_codec_error() {
        assert!(matches!(
            cbor_decode::<TestMsg>(&[]),
            Err(CvmError::Codec(_))
        ));
    }
}
