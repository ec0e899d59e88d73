//! Length-prefixed `bincode` framing over a byte stream, the concrete
//! transport realization of §6's "byte-level RPC transport" external
//! collaborator. Mirrors the teacher workspace's `AsyncBincodeStream`
//! convention: frame on the wire is a big-endian u32 length prefix
//! followed by a `bincode`-encoded payload; `tokio_util::codec`'s
//! length-delimited codec does the framing, `bincode` does the encoding.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

use ps_errors::{PsError, PsResult};

/// The maximum single-message size this transport accepts, guarding
/// against a corrupt or malicious length prefix causing an unbounded
/// allocation.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Build the length-delimited codec every connection in this workspace
/// uses, with a consistent frame-size cap.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .length_field_type::<u32>()
        .new_codec()
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encode `value` to a `bincode` payload (the codec above handles the
/// length prefix; this is just the payload bytes).
pub fn encode<T: Serialize>(value: &T) -> PsResult<Vec<u8>> {
    bincode_options()
        .serialize(value)
        .map_err(|e| PsError::internal(format!("bincode encode failed: {e}")))
}

/// Decode a `bincode` payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> PsResult<T> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| PsError::internal(format!("bincode decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Request, Response};
    use crate::messages::is_all_ps_working;

    #[test]
    fn request_round_trips_through_encode_decode() {
        let req = Request::IsAllPsWorking(is_all_ps_working::Request);
        let bytes = encode(&req).unwrap();
        let back: Request = decode(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn response_round_trips_through_encode_decode() {
        let resp = Response::IsAllPsWorking(is_all_ps_working::Response { yes: true });
        let bytes = encode(&resp).unwrap();
        let back: Response = decode(&bytes).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn decode_rejects_garbage() {
        let garbage = vec![0xffu8; 3];
        let result: PsResult<Request> = decode(&garbage);
        assert!(result.is_err());
    }
}
