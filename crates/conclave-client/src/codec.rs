//! CBOR helpers for records and ciphertext envelopes.
//!
//! Every serialized value this crate persists or puts on the wire goes
//! through these two functions, so corrupt input surfaces as one error
//! variant with the deserializer's own description attached.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// Encode a record or envelope to CBOR.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClientError> {
    let mut wire = Vec::new();
    ciborium::ser::into_writer(value, &mut wire)
        .map_err(|e| ClientError::Wire { reason: e.to_string() })?;
    Ok(wire)
}

/// Decode a record or envelope from CBOR.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ClientError> {
    ciborium::de::from_reader(bytes).map_err(|e| ClientError::Wire { reason: e.to_string() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use conclave_crypto::ChainMessage;

    use super::*;

    #[test]
    fn envelope_round_trip() {
        let message = ChainMessage { generation: 3, random: [7; 8], ciphertext: vec![1, 2] };
        let wire = encode(&message).unwrap();
        let back: ChainMessage = decode(&wire).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn garbage_decodes_to_wire_error() {
        let result: Result<ChainMessage, _> = decode(&[0xff, 0x13]);
        assert!(matches!(result, Err(ClientError::Wire { .. })));
    }
}
