//! COBS-framed, CRC-checked CAN-over-serial transport (spec §5).
//!
//! Wire framing: `0x00 ‖ cobs(id:u32-le ‖ data ‖ crc16:u16-le) ‖ 0x00`.
//! CRC is CRC-16/KERMIT over `id ‖ data`. Entirely synchronous: the
//! [`propcan::Transport`] methods block the calling thread on serial I/O;
//! unlike the Ocarina transport there is no background decoder thread to
//! bridge, so callers on an async runtime should drive this transport
//! from a dedicated blocking context.

use std::io::{Read as _, Write as _};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crc::{Crc, CRC_16_KERMIT};
use log::debug;
use propcan::codec::stringify;
use propcan::{Error, Frame, Transport};
use serialport::SerialPort;

const KERMIT: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);
const CRC_LENGTH: usize = 2;
const ID_LENGTH: usize = 4;

/// A serial port wrapped in COBS/CRC framing, implementing the bus's
/// [`Transport`] trait directly over a blocking `serialport::SerialPort`.
pub struct SerialCanTransport {
    port: Box<dyn SerialPort>,
    buffer: Vec<u8>,
}

impl SerialCanTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, Error> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| Error::Transport(format!("failed to open {path}: {e}")))?;
        Ok(SerialCanTransport {
            port,
            buffer: Vec::new(),
        })
    }

    fn read_one_frame(&mut self, deadline: Option<Instant>) -> Result<Frame, Error> {
        loop {
            if let Some(frame) = self.try_decode_buffered()? {
                return Ok(frame);
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }
                    remaining
                }
                None => Duration::from_secs(3600),
            };
            self.port
                .set_timeout(timeout)
                .map_err(|e| Error::Transport(format!("failed to set serial timeout: {e}")))?;

            let mut byte = [0u8; 1];
            match self.port.read_exact(&mut byte) {
                Ok(()) => self.buffer.push(byte[0]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(Error::Timeout),
                Err(e) => return Err(Error::Transport(format!("serial read failed: {e}"))),
            }
        }
    }

    /// Pull complete `0x00`-delimited chunks out of `self.buffer`, skipping
    /// malformed ones (bad COBS, short body, bad CRC), until a valid frame
    /// is found or the buffer holds no more complete chunks.
    fn try_decode_buffered(&mut self) -> Result<Option<Frame>, Error> {
        while let Some(terminator) = self.buffer.iter().position(|&b| b == 0x00) {
            let encoded: Vec<u8> = self.buffer.drain(0..=terminator).collect();
            let encoded = &encoded[..encoded.len() - 1];

            if encoded.is_empty() {
                continue;
            }

            let decoded = match cobs::decode_vec(encoded) {
                Ok(decoded) => decoded,
                Err(_) => {
                    debug!("discarding frame with bad cobs encoding");
                    continue;
                }
            };

            if decoded.len() < ID_LENGTH + CRC_LENGTH {
                debug!("discarding undersized frame ({} bytes)", decoded.len());
                continue;
            }

            let (body, crc_bytes) = decoded.split_at(decoded.len() - CRC_LENGTH);
            let expected_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
            if KERMIT.checksum(body) != expected_crc {
                debug!("discarding frame with bad crc");
                continue;
            }

            let id = u32::from_le_bytes(body[0..ID_LENGTH].try_into().unwrap());
            let frame = Frame::new(id, body[ID_LENGTH..].to_vec());
            debug!("rx {}", stringify(&frame));
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for SerialCanTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        debug!("tx {}", stringify(&frame));

        let mut body = Vec::with_capacity(ID_LENGTH + frame.data().len() + CRC_LENGTH);
        body.extend_from_slice(&frame.id().to_le_bytes());
        body.extend_from_slice(frame.data());
        let crc = KERMIT.checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let encoded = cobs::encode_vec(&body);

        let mut wire = Vec::with_capacity(encoded.len() + 2);
        wire.push(0x00);
        wire.extend_from_slice(&encoded);
        wire.push(0x00);

        self.port
            .write_all(&wire)
            .map_err(|e| Error::Transport(format!("serial write failed: {e}")))
    }

    async fn receive(&mut self, deadline: Option<Instant>) -> Result<Frame, Error> {
        self.read_one_frame(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kermit_matches_known_vector() {
        // "123456789" -> 0x2189 is the standard CRC-16/KERMIT check value.
        assert_eq!(KERMIT.checksum(b"123456789"), 0x2189);
    }

    #[test]
    fn cobs_round_trip_with_embedded_zero() {
        let body = vec![0x00, 0xAB, 0x00, 0x01, 0x02];
        let encoded = cobs::encode_vec(&body);
        assert!(!encoded.contains(&0x00));
        let decoded = cobs::decode_vec(&encoded).unwrap();
        assert_eq!(decoded, body);
    }
}
