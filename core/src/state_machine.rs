//! Protocol state machines that turn request/response exchanges into
//! completed operations (spec §4.I).
//!
//! Per spec §9, frame ingestion is a three-variant outcome rather than a
//! boolean: a frame may advance the state machine (`Consumed`), be
//! irrelevant to it because the bus is shared (`Ignored`), or be malformed
//! (`Err(Error::Protocol)`).

use crate::codec::{
    make_read_manifest_request, make_read_property_request, make_write_property_request, unpack_id,
};
use crate::envelope::check_envelope_header;
use crate::frame::Frame;
use crate::model::{Direction, ErrorCode, NodeId, Opcode, PropertyIndex, SEGMENT_SIZE};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Consumed,
    Ignored,
}

/// Closed set of state machines (spec §9: tagged union over dynamic
/// dispatch, since there are exactly two variants).
pub trait StateMachine {
    fn is_finished(&self) -> bool;

    /// Idempotent when called twice in a row with no intervening
    /// `frame_received`: the second call returns `None`.
    fn get_frame_to_send(&mut self) -> Result<Option<Frame>, Error>;

    fn frame_received(&mut self, frame: &Frame) -> Result<FrameOutcome, Error>;
}

/// Drives a `ManifestDownload` to completion, one 8-byte segment at a
/// time.
pub struct ManifestDownload {
    node_id: NodeId,
    envelope: Vec<u8>,
    expected_length: Option<usize>,
    last_request_at_length: Option<usize>,
}

impl ManifestDownload {
    pub fn new(node_id: NodeId) -> Self {
        ManifestDownload {
            node_id,
            envelope: Vec::new(),
            expected_length: None,
            last_request_at_length: None,
        }
    }

    pub fn get_manifest_envelope(&self) -> &[u8] {
        &self.envelope
    }

    pub fn into_manifest_envelope(self) -> Vec<u8> {
        self.envelope
    }

    fn current_segment(&self) -> usize {
        self.envelope.len() / SEGMENT_SIZE
    }
}

impl StateMachine for ManifestDownload {
    fn is_finished(&self) -> bool {
        self.expected_length == Some(self.envelope.len())
    }

    fn get_frame_to_send(&mut self) -> Result<Option<Frame>, Error> {
        let current_length = self.envelope.len();
        if self.last_request_at_length != Some(current_length) {
            self.last_request_at_length = Some(current_length);
            let segment = self.current_segment();
            let frame = make_read_manifest_request(self.node_id, segment as u8)?;
            return Ok(Some(frame));
        }
        Ok(None)
    }

    fn frame_received(&mut self, frame: &Frame) -> Result<FrameOutcome, Error> {
        let (node_id, property_index, opcode, direction) = match unpack_id(frame.id()) {
            Ok(v) => v,
            Err(_) => return Ok(FrameOutcome::Ignored),
        };

        let expected_segment = self.current_segment();
        if direction != Direction::DeviceToClient
            || node_id != self.node_id
            || opcode != Opcode::ReadManifest
            || property_index as usize != expected_segment
        {
            return Ok(FrameOutcome::Ignored);
        }

        if frame.data().is_empty() {
            return Err(Error::Protocol(format!(
                "expected READ_MANIFEST reply with data, got {}",
                crate::codec::stringify(frame)
            )));
        }

        if self.expected_length.is_none() {
            if frame.data().len() != SEGMENT_SIZE {
                return Err(Error::Protocol(format!(
                    "expected {SEGMENT_SIZE}-byte reply for the first manifest segment"
                )));
            }
            self.expected_length = Some(check_envelope_header(frame.data())?);
            self.envelope.extend_from_slice(frame.data());
        } else {
            self.envelope.extend_from_slice(frame.data());
            let expected_length = self.expected_length.unwrap();
            if self.envelope.len() < expected_length {
                if frame.data().len() != SEGMENT_SIZE {
                    return Err(Error::Protocol(format!(
                        "expected full {SEGMENT_SIZE}-byte segment before the final one"
                    )));
                }
            } else if self.envelope.len() > expected_length {
                return Err(Error::Protocol("manifest body too long".into()));
            }
        }

        Ok(FrameOutcome::Consumed)
    }
}

/// A single property read or write, driven to completion by the device's
/// echoed reply.
pub struct PropertyQuery {
    node_id: NodeId,
    property_index: PropertyIndex,
    opcode: Opcode,
    set_value: Option<Vec<u8>>,
    get_value: Option<Vec<u8>>,
    request_sent: bool,
}

impl PropertyQuery {
    pub fn new_read(node_id: NodeId, property_index: PropertyIndex) -> Self {
        PropertyQuery {
            node_id,
            property_index,
            opcode: Opcode::ReadProperty,
            set_value: None,
            get_value: None,
            request_sent: false,
        }
    }

    pub fn new_write(node_id: NodeId, property_index: PropertyIndex, value: Vec<u8>) -> Self {
        PropertyQuery {
            node_id,
            property_index,
            opcode: Opcode::WriteProperty,
            set_value: Some(value),
            get_value: None,
            request_sent: false,
        }
    }

    pub fn get_value(&self) -> Option<&[u8]> {
        self.get_value.as_deref()
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        self.get_value
    }
}

impl StateMachine for PropertyQuery {
    fn is_finished(&self) -> bool {
        self.get_value.is_some()
    }

    fn get_frame_to_send(&mut self) -> Result<Option<Frame>, Error> {
        if self.request_sent {
            return Ok(None);
        }
        self.request_sent = true;

        let frame = match self.opcode {
            Opcode::WriteProperty => make_write_property_request(
                self.node_id,
                self.property_index,
                self.set_value.clone().unwrap_or_default(),
            )?,
            _ => make_read_property_request(self.node_id, self.property_index)?,
        };
        Ok(Some(frame))
    }

    fn frame_received(&mut self, frame: &Frame) -> Result<FrameOutcome, Error> {
        let (node_id, property_index, opcode, direction) = match unpack_id(frame.id()) {
            Ok(v) => v,
            Err(_) => return Ok(FrameOutcome::Ignored),
        };

        if direction == Direction::DeviceToClient
            && node_id == self.node_id
            && opcode == Opcode::Error
            && property_index == self.property_index.value()
            && frame.data().len() == 2
        {
            let request_opcode = Opcode::try_from(frame.data()[0])
                .map_err(|_| Error::Protocol("malformed error response opcode field".into()))?;
            let error_code = ErrorCode::try_from(frame.data()[1])
                .map_err(|_| Error::Protocol("malformed error response error-code field".into()))?;
            return Err(Error::DeviceError {
                request_opcode,
                error_code,
            });
        }

        if direction != Direction::DeviceToClient
            || node_id != self.node_id
            || opcode != self.opcode
            || property_index != self.property_index.value()
        {
            return Ok(FrameOutcome::Ignored);
        }

        if frame.data().is_empty() {
            return Err(Error::Protocol(format!(
                "expected {:?} reply with data, got {}",
                self.opcode,
                crate::codec::stringify(frame)
            )));
        }

        self.get_value = Some(frame.data().to_vec());
        Ok(FrameOutcome::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{make_read_manifest_response, make_read_property_response};
    use crate::envelope::add_envelope;

    #[test]
    fn idempotent_emit() {
        let node_id = NodeId::new(1).unwrap();
        let mut sm = ManifestDownload::new(node_id);
        let first = sm.get_frame_to_send().unwrap();
        assert!(first.is_some());
        let second = sm.get_frame_to_send().unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn s5_segmented_download() {
        let node_id = NodeId::new(2).unwrap();
        let envelope = add_envelope(b"Fixture\n", 0xF1).unwrap();
        assert_eq!(envelope.len(), 20, "test fixture assumes a 20-byte envelope");

        let mut sm = ManifestDownload::new(node_id);
        let mut round_trips = 0;
        while !sm.is_finished() {
            let req = sm.get_frame_to_send().unwrap().expect("a request is pending");
            let (_, segment, _, _) = unpack_id(req.id()).unwrap();
            let start = segment as usize * SEGMENT_SIZE;
            let end = (start + SEGMENT_SIZE).min(envelope.len());
            let reply = make_read_manifest_response(node_id, segment, envelope[start..end].to_vec()).unwrap();
            assert_eq!(sm.frame_received(&reply).unwrap(), FrameOutcome::Consumed);
            round_trips += 1;
        }
        assert_eq!(round_trips, 3);
        assert_eq!(sm.get_manifest_envelope(), envelope.as_slice());
    }

    #[test]
    fn segment_boundary_rejects_short_non_final_segment() {
        let node_id = NodeId::new(3).unwrap();
        let envelope = add_envelope(b"0123456789abcdef", 0xF1).unwrap();
        assert!(envelope.len() > SEGMENT_SIZE * 2);

        let mut sm = ManifestDownload::new(node_id);
        sm.get_frame_to_send().unwrap();
        let short_reply =
            make_read_manifest_response(node_id, 0, envelope[0..SEGMENT_SIZE - 1].to_vec()).unwrap();
        assert!(sm.frame_received(&short_reply).is_err());
    }

    #[test]
    fn non_matching_frames_are_ignored() {
        let node_id = NodeId::new(4).unwrap();
        let other_node = NodeId::new(5).unwrap();
        let mut sm = ManifestDownload::new(node_id);
        sm.get_frame_to_send().unwrap();

        let unrelated = make_read_manifest_response(other_node, 0, vec![0; 8]).unwrap();
        assert_eq!(sm.frame_received(&unrelated).unwrap(), FrameOutcome::Ignored);
    }

    #[test]
    fn property_query_read_completes_on_reply() {
        let node_id = NodeId::new(6).unwrap();
        let index = PropertyIndex::new(3).unwrap();
        let mut sm = PropertyQuery::new_read(node_id, index);
        assert!(sm.get_frame_to_send().unwrap().is_some());
        assert!(sm.get_frame_to_send().unwrap().is_none());

        let reply = make_read_property_response(node_id, index, vec![0x12, 0x34]).unwrap();
        assert_eq!(sm.frame_received(&reply).unwrap(), FrameOutcome::Consumed);
        assert!(sm.is_finished());
        assert_eq!(sm.get_value(), Some(&[0x12, 0x34][..]));
    }

    #[test]
    fn property_query_surfaces_device_error() {
        let node_id = NodeId::new(7).unwrap();
        let index = PropertyIndex::new(3).unwrap();
        let mut sm = PropertyQuery::new_read(node_id, index);
        sm.get_frame_to_send().unwrap();

        let err = crate::codec::make_error_response(
            node_id,
            index.value(),
            Opcode::ReadProperty,
            ErrorCode::NotImplemented,
        )
        .unwrap();
        match sm.frame_received(&err) {
            Err(Error::DeviceError { error_code, .. }) => {
                assert_eq!(error_code, ErrorCode::NotImplemented)
            }
            other => panic!("expected DeviceError, got {other:?}"),
        }
    }
}
