//! Outer packet framing.
//!
//! Every packet is `varint(payload_length) || payload`. Once the server has
//! sent Set Compression, the payload becomes `varint(uncompressed_length) ||
//! zlib(packet_id || fields)` for bodies at or above the threshold, and
//! `varint(0) || packet_id || fields` below it. Whether the extra length
//! field is present at all depends on the session having negotiated
//! compression, not on anything inside the packet.

use std::io::{Read, Write};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use super::{
    ProtocolError,
    codec::{self, Reader},
};

/// Compression disabled. Any threshold `>= 0` means the server asked for
/// compression of bodies at least that long.
pub const COMPRESSION_OFF: i32 = -1;

/// Builds a full frame (length prefix included) around a packet body of
/// `packet_id || fields`.
pub fn encode(body: &[u8], threshold: i32) -> Result<Vec<u8>, ProtocolError> {
    let payload = if threshold < 0 {
        body.to_vec()
    } else if body.len() < threshold as usize {
        // under the threshold the body is sent as-is, with a zero length
        // field marking it uncompressed
        let mut payload = Vec::with_capacity(body.len() + 1);
        codec::write_varint(&mut payload, 0);
        payload.extend_from_slice(body);
        payload
    } else {
        let mut payload = Vec::new();
        codec::write_varint(&mut payload, body.len() as i32);
        let mut encoder = ZlibEncoder::new(payload, Compression::default());
        encoder.write_all(body).map_err(ProtocolError::Compress)?;
        encoder.finish().map_err(ProtocolError::Compress)?
    };

    let mut frame = Vec::with_capacity(payload.len() + codec::MAX_VARINT_BYTES);
    codec::write_varint(&mut frame, payload.len() as i32);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Recovers the packet body from a frame's payload (the bytes after the
/// outer length prefix).
pub fn decode(payload: &[u8], threshold: i32) -> Result<Vec<u8>, ProtocolError> {
    if threshold < 0 {
        return Ok(payload.to_vec());
    }

    let mut reader = Reader::new(payload);
    let declared = reader.read_varint()?;
    if declared < 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "negative data length {declared}"
        )));
    }
    let rest = reader.read_rest();
    if declared == 0 {
        return Ok(rest.to_vec());
    }

    let mut body = Vec::with_capacity(declared as usize);
    ZlibDecoder::new(rest)
        .read_to_end(&mut body)
        .map_err(ProtocolError::Decompress)?;
    if body.len() != declared as usize {
        return Err(ProtocolError::DecompressedLengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_length_prefix(frame: &[u8]) -> (i32, Vec<u8>) {
        let mut reader = Reader::new(frame);
        let len = reader.read_varint().unwrap();
        (len, reader.read_rest().to_vec())
    }

    #[test]
    fn roundtrip_uncompressed() {
        let body = b"\x00\x0bhello world".to_vec();
        let frame = encode(&body, COMPRESSION_OFF).unwrap();

        let (len, payload) = strip_length_prefix(&frame);
        assert_eq!(len as usize, payload.len());
        assert_eq!(decode(&payload, COMPRESSION_OFF).unwrap(), body);
    }

    #[test]
    fn roundtrip_below_threshold() {
        let body = b"\x00tiny".to_vec();
        let frame = encode(&body, 256).unwrap();

        let (_, payload) = strip_length_prefix(&frame);
        // zero length field, then the body verbatim
        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..], &body[..]);
        assert_eq!(decode(&payload, 256).unwrap(), body);
    }

    #[test]
    fn roundtrip_compressed() {
        let body = vec![0x42u8; 4096];
        let frame = encode(&body, 64).unwrap();

        let (len, payload) = strip_length_prefix(&frame);
        assert_eq!(len as usize, payload.len());
        // zlib should do well on 4096 repeated bytes
        assert!(payload.len() < body.len());
        assert_eq!(decode(&payload, 64).unwrap(), body);
    }

    #[test]
    fn declared_length_must_match() {
        let body = vec![0x42u8; 4096];
        let frame = encode(&body, 64).unwrap();
        let (_, mut payload) = strip_length_prefix(&frame);

        // corrupt the declared uncompressed length (4096 = 0x80 0x20)
        payload[0] = 0x81;
        assert!(matches!(
            decode(&payload, 64),
            Err(ProtocolError::DecompressedLengthMismatch { .. })
        ));
    }
}
