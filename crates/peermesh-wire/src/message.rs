//! Frame codec.
//!
//! Every envelope on a mesh connection is prefixed with a 4-byte big-endian
//! length header followed by the JSON body. A bad body only loses that frame;
//! a bad header (oversized length) desynchronises the stream.

use crate::error::WireError;
use peermesh_types::envelope::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode an envelope to bytes (4-byte big-endian length + JSON).
///
/// Envelopes that would not decode back to themselves are refused.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    envelope.validate()?;
    let json = serde_json::to_vec(envelope)?;
    if json.len() > MAX_FRAME_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: u32::try_from(json.len()).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a frame body into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, WireError> {
    Ok(serde_json::from_slice(body)?)
}

/// Write pre-encoded frame bytes and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write a single envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    write_frame(writer, &frame).await
}

/// Read one frame body. Clean EOF before a header is `ConnectionClosed`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peermesh_types::envelope::{EnvelopeError, MessageKind, Payload};
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut payload = Payload::new();
        payload.insert("cpu".into(), json!(0.25));
        let env = Envelope::custom("GetStatus", payload)
            .from_node("node-a")
            .for_component("Metrics");
        let bytes = encode_frame(&env).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_envelope(&bytes[4..]).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_floats_survive_the_wire_bit_exact() {
        let mut values = vec![
            f64::MAX,
            f64::MIN,
            f64::MIN_POSITIVE,
            f64::EPSILON,
            5e-324,
            -2.2250738585072014e-308,
            0.1,
            1.0 / 3.0,
            1e-75,
            1e22,
        ];
        // xorshift64 over raw bit patterns, keeping only finite values.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        while values.len() < 2_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let value = f64::from_bits(state);
            if value.is_finite() {
                values.push(value);
            }
        }

        let mut payload = Payload::new();
        payload.insert("values".into(), json!(values));
        let env = Envelope::custom("Samples", payload);
        let decoded = decode_envelope(&encode_frame(&env).unwrap()[4..]).unwrap();

        let MessageKind::Custom { payload, .. } = decoded.kind else {
            panic!("Expected Custom");
        };
        let got = payload["values"].as_array().unwrap();
        assert_eq!(got.len(), values.len());
        for (sent, back) in values.iter().zip(got) {
            let back = back.as_f64().unwrap();
            assert_eq!(sent.to_bits(), back.to_bits(), "{sent:e} came back as {back:e}");
        }
    }

    #[test]
    fn test_reserved_custom_type_is_not_encoded() {
        let shadow = Envelope::custom("Ping", Payload::new()).from_node("node-a");
        assert!(matches!(
            encode_frame(&shadow),
            Err(WireError::InvalidEnvelope(EnvelopeError::ReservedMessageType(_)))
        ));
        assert!(matches!(
            encode_frame(&Envelope::custom("", Payload::new())),
            Err(WireError::InvalidEnvelope(EnvelopeError::MissingMessageType))
        ));
    }

    #[test]
    fn test_decode_garbage_is_json_error() {
        assert!(matches!(
            decode_envelope(b"{not json"),
            Err(WireError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_preserves_frame_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let first = Envelope::ping("node-b").from_node("node-a");
        let second = Envelope::shutdown("bye").from_node("node-a");
        write_envelope(&mut client, &first).await.unwrap();
        write_envelope(&mut client, &second).await.unwrap();
        drop(client);

        let a = decode_envelope(&read_frame(&mut server).await.unwrap()).unwrap();
        let b = decode_envelope(&read_frame(&mut server).await.unwrap()).unwrap();
        assert_eq!(a, first);
        assert!(matches!(b.kind, MessageKind::Shutdown(_)));
        assert!(matches!(
            read_frame(&mut server).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        match read_frame(&mut server).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }
}
