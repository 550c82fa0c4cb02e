//! Manifest envelope: a hash-checked, length-prefixed, compressed
//! container wrapping the textual schema (spec §4.F).
//!
//! Layout: `hash4(4) ‖ length:u16-le(2) ‖ version:u8(1) ‖ body(length)`.

use deku::prelude::*;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

use crate::Error;

pub const HEADER_LENGTH: usize = 7;
pub const DRAFT_CSV_ZLIB: u8 = 0xF1;

/// Opaque enveloped bytes, as observed on the wire.
pub type ManifestEnvelope = Vec<u8>;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct EnvelopeHeader {
    hash: [u8; 4],
    length: u16,
    version: u8,
}

/// Read the 7-byte header and return the total envelope length
/// (`7 + length`). Safe to call as soon as 7 bytes are buffered.
pub fn check_envelope_header(envelope: &[u8]) -> Result<usize, Error> {
    if envelope.len() < HEADER_LENGTH {
        return Err(Error::Protocol("envelope header truncated".into()));
    }
    let (_, header) = EnvelopeHeader::from_bytes((envelope, 0))
        .map_err(|e| Error::Protocol(format!("malformed envelope header: {e}")))?;
    Ok(HEADER_LENGTH + header.length as usize)
}

/// Compress `body` with zlib at maximum compression, compute the SHA-1
/// of the compressed bytes, and prepend the header.
pub fn add_envelope(body: &[u8], version: u8) -> Result<ManifestEnvelope, Error> {
    if version != DRAFT_CSV_ZLIB {
        return Err(Error::Protocol(format!("unsupported envelope version {version:#04x}")));
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(body)
        .map_err(|e| Error::Protocol(format!("zlib compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Protocol(format!("zlib compression failed: {e}")))?;

    if compressed.len() > u16::MAX as usize {
        return Err(Error::Protocol("compressed manifest body too long".into()));
    }

    let hash = Sha1::digest(&compressed);

    let header = EnvelopeHeader {
        hash: hash[0..4].try_into().expect("sha1 digest is at least 4 bytes"),
        length: compressed.len() as u16,
        version,
    };

    let mut envelope = header
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("failed to serialize envelope header: {e}")))?;
    envelope.extend_from_slice(&compressed);
    Ok(envelope)
}

/// Unwrap an envelope: validate the header, recompute and compare the
/// hash, decompress, and return the raw schema bytes (NOT parsed — the
/// caller hands these to the schema codec, spec §4.G).
pub fn parse_envelope(envelope: &[u8]) -> Result<Vec<u8>, Error> {
    if envelope.len() < HEADER_LENGTH {
        return Err(Error::Protocol("envelope header truncated".into()));
    }

    let (_, header) = EnvelopeHeader::from_bytes((envelope, 0))
        .map_err(|e| Error::Protocol(format!("malformed envelope header: {e}")))?;

    let body = &envelope[HEADER_LENGTH..];
    if body.len() != header.length as usize {
        return Err(Error::Protocol(format!(
            "envelope length mismatch: header says {}, got {}",
            header.length,
            body.len()
        )));
    }

    if header.version != DRAFT_CSV_ZLIB {
        return Err(Error::Protocol(format!(
            "unknown manifest version {:#04x}",
            header.version
        )));
    }

    let computed_hash = Sha1::digest(body);
    if computed_hash[0..4] != header.hash[..] {
        return Err(Error::Protocol("envelope hash mismatch".into()));
    }

    let mut decoder = ZlibDecoder::new(body);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Protocol(format!("zlib decompression failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{parse_manifest_draft_csv, serialize_manifest_draft_csv};

    #[test]
    fn envelope_round_trip() {
        for body in [&b""[..], b"hello", b"Silly-Name\n", &[0u8; 200]] {
            let enveloped = add_envelope(body, DRAFT_CSV_ZLIB).unwrap();
            let recovered = parse_envelope(&enveloped).unwrap();
            assert_eq!(recovered, body);
        }
    }

    #[test]
    fn hash_binding() {
        let enveloped = add_envelope(b"hello world", DRAFT_CSV_ZLIB).unwrap();
        for i in HEADER_LENGTH..enveloped.len() {
            let mut mutated = enveloped.clone();
            mutated[i] ^= 0xFF;
            assert!(parse_envelope(&mutated).is_err(), "byte {i} should invalidate hash");
        }
    }

    #[test]
    fn s3_envelope_parse() {
        let enveloped = add_envelope(b"Silly-Name\n", DRAFT_CSV_ZLIB).unwrap();
        let body = &enveloped[HEADER_LENGTH..];
        let len_field = u16::from_le_bytes([enveloped[4], enveloped[5]]) as usize;
        assert_eq!(len_field, body.len());
        assert_eq!(enveloped[6], DRAFT_CSV_ZLIB);

        let decoded = parse_envelope(&enveloped).unwrap();
        let manifest = parse_manifest_draft_csv(&decoded).unwrap();
        assert_eq!(manifest.device_name, "Silly-Name");
        assert!(manifest.properties.is_empty());
    }

    #[test]
    fn manifest_bytes_round_trip_through_envelope() {
        let body = b"Widget\nvoltage,H,mV,0,1,0,65535,r\n";
        let enveloped = add_envelope(body, DRAFT_CSV_ZLIB).unwrap();
        let decoded = parse_envelope(&enveloped).unwrap();
        assert_eq!(decoded, body);

        let from_envelope = parse_manifest_draft_csv(&decoded).unwrap();
        let from_body = parse_manifest_draft_csv(body).unwrap();
        assert_eq!(
            serialize_manifest_draft_csv(&from_envelope),
            serialize_manifest_draft_csv(&from_body)
        );
    }
}
