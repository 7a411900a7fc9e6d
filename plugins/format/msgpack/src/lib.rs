use relay_api::{Envelope, EnvelopeCodec, MAX_DATAGRAM_SIZE, RelayError};

// ═══════════════════════════════════════════════════════════════
//  MsgpackCodec
// ═══════════════════════════════════════════════════════════════

/// Envelope как MessagePack map с именованными полями
/// (`Channel`, `Measurement`, `Timestamp`).
pub struct MsgpackCodec {
    max_size: usize,
}

impl Default for MsgpackCodec {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_SIZE)
    }
}

impl MsgpackCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl EnvelopeCodec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, RelayError> {
        let bytes = rmp_serde::to_vec_named(envelope)
            .map_err(|e| RelayError::Serialization(format!("msgpack: {e}")))?;
        if bytes.len() > self.max_size {
            return Err(RelayError::OversizedPayload {
                size: bytes.len(),
                limit: self.max_size,
            });
        }
        Ok(bytes)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, RelayError> {
        if data.len() > self.max_size {
            return Err(RelayError::decode(format!(
                "msgpack: datagram is {} bytes, limit is {}",
                data.len(),
                self.max_size
            )));
        }
        rmp_serde::from_slice(data).map_err(|e| RelayError::decode(format!("msgpack: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let codec = MsgpackCodec::default();
        for env in [
            Envelope::new("a", vec![1, 2, 3], 100),
            Envelope::new("position_updates", vec![0xff; 300], -1),
            Envelope::new("", Vec::new(), 0),
        ] {
            let bytes = codec.encode(&env).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn oversized_is_rejected() {
        let codec = MsgpackCodec::new(64);
        let env = Envelope::new("a", vec![1u8; 100], 1);
        assert!(matches!(
            codec.encode(&env),
            Err(RelayError::OversizedPayload { limit: 64, .. })
        ));
    }

    #[test]
    fn malformed_input_is_decode_error() {
        let codec = MsgpackCodec::default();
        let bytes = codec.encode(&Envelope::new("a", vec![1, 2, 3], 100)).unwrap();
        assert!(matches!(codec.decode(&bytes[..bytes.len() - 2]), Err(RelayError::Decode(_))));
        assert!(matches!(codec.decode(b"\xc1\xc1"), Err(RelayError::Decode(_))));
    }
}
