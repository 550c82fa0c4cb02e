//! Wire-level constants and event decoding for the Ocarina adapter's ASCII
//! command/event protocol: one opcode byte, one length byte, then payload
//! (no checksum — framing errors surface as `Error::Protocol`).

use num_enum::TryFromPrimitive;

use crate::Error;

/// Commands the host may send to the adapter.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    AutoBitrate = b'a',
    SetBitrate = b'b',
    QueryCounters = b'c',
    ResetCounters = b'C',
    Dfu = b'd',
    QueryErrorFlags = b'e',
    RxForwardingEnable = b'F',
    RxForwardingDisable = b'f',
    QueryConfig = b'g',
    QueryInterfaceId = b'i',
    SendMessageStdId = b'm',
    SendMessageExtId = b'M',
    Nop = b'n',
    LoopbackEnable = b'L',
    LoopbackDisable = b'l',
    Reset = b'r',
    SilentEnable = b'S',
    SilentDisable = b's',
    QueryVersion = b'v',
}

/// Event opcodes the adapter may send to the host.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Dth {
    InterfaceId = b'i',
    ErrorFlags = b'e',
    ErrorOnCan = b'E',
    MessageStdId = b'm',
    MessageExtId = b'M',
    Config = b'g',
    Version = b'v',
    Counters = b'c',
    Heartbeat = b'h',
}

pub const SYNC_FRAME: [u8; 24] = [0xAA; 24];

/// CAN bus bitrate presets the adapter supports, keyed by their wire
/// identifier byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Bitrate {
    Unknown = 0,
    Kbit10 = 1,
    Kbit20 = 2,
    Kbit50 = 3,
    Kbit100 = 4,
    Kbit125 = 5,
    Kbit250 = 6,
    Kbit500 = 7,
    Kbit800 = 8,
    Kbit1000 = 9,
}

/// Bus error classification, mapped directly from the CAN controller's LEC.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum CanError {
    None = 0,
    Stuff = 1,
    Form = 2,
    Acknowledgment = 3,
    BitRecessive = 4,
    BitDominant = 5,
    Crc = 6,
    SetBySoftware = 7,
    Unknown = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Ok,
    Passive,
    Off,
}

impl BusState {
    fn from_nibble(value: u8) -> Self {
        match value & 0xF {
            0 => BusState::Ok,
            1 => BusState::Passive,
            _ => BusState::Off,
        }
    }
}

/// The fixed, documented error-flag bits the adapter can report.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFlag {
    UsbInOverflow = 0,
    UsbOutOverflow = 1,
    CanInOverflow = 2,
    CanOutOverflow = 3,
    InvalidCanMsgRequest = 4,
    InvalidCommand = 5,
    NotInitializedTx = 6,
    InvalidTlv = 7,
    TooLongTlv = 8,
}

const ALL_ERROR_FLAGS: [ErrorFlag; 9] = [
    ErrorFlag::UsbInOverflow,
    ErrorFlag::UsbOutOverflow,
    ErrorFlag::CanInOverflow,
    ErrorFlag::CanOutOverflow,
    ErrorFlag::InvalidCanMsgRequest,
    ErrorFlag::InvalidCommand,
    ErrorFlag::NotInitializedTx,
    ErrorFlag::InvalidTlv,
    ErrorFlag::TooLongTlv,
];

/// A decoded adapter event, handed to callers via [`crate::Ocarina::read_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Heartbeat,
    Version {
        protocol: u8,
        sw: u8,
        hw: u8,
        hw_revision: u8,
    },
    CanMessage {
        id: u32,
        extended: bool,
        data: Vec<u8>,
        timestamp_us: u64,
    },
    CanError {
        tec: u8,
        rec: u8,
        bus_state: BusState,
        error: CanError,
        timestamp_us: u64,
    },
    ErrorFlags {
        raw: u32,
        flags: Vec<ErrorFlag>,
    },
    Config {
        bitrate: Bitrate,
        silent: bool,
        loopback: bool,
        forward: bool,
    },
    InterfaceId(String),
    Counters {
        received: u32,
        transmitted: u32,
    },
}

/// A payload buffer consumed front-to-back, mirroring the source's `Payload`.
struct Payload<'a> {
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    fn new(data: &'a [u8]) -> Self {
        Payload { data }
    }

    fn pop(&mut self, amount: usize) -> Result<&'a [u8], Error> {
        if amount > self.data.len() {
            return Err(Error::Protocol(format!(
                "event payload underrun: wanted {amount} bytes, had {}",
                self.data.len()
            )));
        }
        let (taken, rest) = self.data.split_at(amount);
        self.data = rest;
        Ok(taken)
    }

    fn pop_u8(&mut self) -> Result<u8, Error> {
        Ok(self.pop(1)?[0])
    }

    fn pop_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.pop(2)?.try_into().unwrap()))
    }

    fn pop_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.pop(4)?.try_into().unwrap()))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decode one `(frame_type, payload)` pair into an [`Event`].
///
/// A non-empty remainder after decoding is logged, not an error: it means
/// the device sent more fields than this decoder understands, not that the
/// frame is malformed.
pub fn decode_event(frame_type: u8, payload: &[u8]) -> Result<Event, Error> {
    let dth = Dth::try_from(frame_type)
        .map_err(|_| Error::Protocol(format!("unknown event opcode {frame_type:#04x}")))?;
    let mut payload = Payload::new(payload);

    let event = match dth {
        Dth::InterfaceId => {
            let raw = payload.rest().to_vec();
            return String::from_utf8(raw)
                .map(Event::InterfaceId)
                .map_err(|e| Error::Protocol(format!("interface id not utf8: {e}")));
        }
        Dth::MessageStdId => {
            let timestamp_us = pop_timestamp(&mut payload)?;
            let id = payload.pop_u16()? as u32;
            let data = payload.rest().to_vec();
            Event::CanMessage {
                id,
                extended: false,
                data,
                timestamp_us,
            }
        }
        Dth::MessageExtId => {
            let timestamp_us = pop_timestamp(&mut payload)?;
            let id = payload.pop_u32()?;
            let data = payload.rest().to_vec();
            Event::CanMessage {
                id,
                extended: true,
                data,
                timestamp_us,
            }
        }
        Dth::ErrorOnCan => {
            let timestamp_us = pop_timestamp(&mut payload)?;
            let tec = payload.pop_u8()?;
            let rec = payload.pop_u8()?;
            let mixed = payload.pop_u8()?;
            let bus_state = BusState::from_nibble(mixed);
            let error = CanError::try_from(mixed >> 4).unwrap_or(CanError::Unknown);
            Event::CanError {
                tec,
                rec,
                bus_state,
                error,
                timestamp_us,
            }
        }
        Dth::ErrorFlags => {
            let raw = payload.pop_u32()?;
            let flags = ALL_ERROR_FLAGS
                .into_iter()
                .filter(|f| raw & (1u32 << (*f as u32)) != 0)
                .collect();
            Event::ErrorFlags { raw, flags }
        }
        Dth::Counters => {
            let received = payload.pop_u32()?;
            let transmitted = payload.pop_u32()?;
            Event::Counters {
                received,
                transmitted,
            }
        }
        Dth::Heartbeat => Event::Heartbeat,
        Dth::Config => {
            let raw = payload.pop_u8()?;
            Event::Config {
                bitrate: Bitrate::try_from(raw & 0xF).unwrap_or(Bitrate::Unknown),
                silent: raw & (1 << 4) != 0,
                loopback: raw & (1 << 5) != 0,
                forward: raw & (1 << 6) != 0,
            }
        }
        Dth::Version => Event::Version {
            protocol: payload.pop_u8()?,
            sw: payload.pop_u8()?,
            hw: payload.pop_u8()?,
            hw_revision: payload.pop_u8()?,
        },
    };

    if !payload.is_empty() {
        log::warn!("event {dth:?} payload not fully consumed, firmware protocol may have changed");
    }

    Ok(event)
}

/// `us_low8 | (us_high32 << 8)`, exactly as the adapter packs its
/// 40-bit microsecond timestamp across the two integer reads.
fn pop_timestamp(payload: &mut Payload<'_>) -> Result<u64, Error> {
    let low = payload.pop_u8()? as u64;
    let high = payload.pop_u32()? as u64;
    Ok(low | (high << 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_heartbeat() {
        assert_eq!(decode_event(b'h', &[]).unwrap(), Event::Heartbeat);
    }

    #[test]
    fn decodes_extended_can_message() {
        let mut payload = vec![0x01u8]; // timestamp low byte
        payload.extend_from_slice(&0x00u32.to_le_bytes()); // timestamp high
        payload.extend_from_slice(&0x1EF1_2903u32.to_le_bytes());
        payload.extend_from_slice(&[0xDE, 0xAD]);

        let event = decode_event(b'M', &payload).unwrap();
        assert_eq!(
            event,
            Event::CanMessage {
                id: 0x1EF1_2903,
                extended: true,
                data: vec![0xDE, 0xAD],
                timestamp_us: 1,
            }
        );
    }

    #[test]
    fn decodes_error_flags_bitset() {
        let raw = (1u32 << ErrorFlag::CanInOverflow as u32) | (1u32 << ErrorFlag::InvalidTlv as u32);
        let event = decode_event(b'e', &raw.to_le_bytes()).unwrap();
        match event {
            Event::ErrorFlags { flags, .. } => {
                assert_eq!(flags, vec![ErrorFlag::CanInOverflow, ErrorFlag::InvalidTlv]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_payload() {
        assert!(decode_event(b'v', &[1, 2]).is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(decode_event(b'?', &[]).is_err());
    }
}
