//! In-process fixtures for exercising `propcan` without real hardware
//! (spec §4.M): a loopback transport and a replay server that backs an
//! in-memory property store from a decoded manifest.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error, warn};
use propcan::codec::{
    make_error_response, make_read_manifest_response, make_read_property_response,
    make_write_property_response, stringify, unpack_id,
};
use propcan::envelope::{add_envelope, parse_envelope, DRAFT_CSV_ZLIB};
use propcan::manifest::{parse_manifest_draft_csv, serialize_manifest_draft_csv, Manifest};
use propcan::model::{Direction, ErrorCode, NodeId, Opcode, SEGMENT_SIZE};
use propcan::{Error, Frame, Transport};
use tokio::sync::mpsc;

/// An in-process, in-memory pair of FIFOs standing in for a real bus.
/// `client_end` is handed to a `propcan::client::Client`; `server_end`
/// drives a `ReplayServer` (or any other fixture) from the other side.
pub struct LoopbackTransport {
    outbox: mpsc::UnboundedSender<Frame>,
    inbox: mpsc::UnboundedReceiver<Frame>,
}

/// Build a connected pair: frames sent on one end arrive on the other.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            outbox: a_tx,
            inbox: b_rx,
        },
        LoopbackTransport {
            outbox: b_tx,
            inbox: a_rx,
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        debug!("loopback tx {}", stringify(&frame));
        self.outbox
            .send(frame)
            .map_err(|_| Error::Transport("loopback peer dropped".into()))
    }

    async fn receive(&mut self, deadline: Option<Instant>) -> Result<Frame, Error> {
        let recv = self.inbox.recv();
        let frame = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, recv).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Err(Error::Transport("loopback peer dropped".into())),
                    Err(_) => return Err(Error::Timeout),
                }
            }
            None => recv.await.ok_or_else(|| Error::Transport("loopback peer dropped".into()))?,
        };
        debug!("loopback rx {}", stringify(&frame));
        Ok(frame)
    }
}

/// Backs `READ_MANIFEST` / `READ_PROPERTY` / `WRITE_PROPERTY` requests for
/// one node ID against an in-memory property store, the way
/// `original_source`'s echo server does, including the ability to force a
/// canned `ERROR` response for testing a client's fail-fast handling.
pub struct ReplayServer {
    node_id: NodeId,
    manifest_envelope: Vec<u8>,
    property_values: HashMap<u8, Vec<u8>>,
    force_error_for: Option<(u8, ErrorCode)>,
}

impl ReplayServer {
    pub fn new(node_id: NodeId, manifest: &Manifest) -> Result<Self, Error> {
        let body = serialize_manifest_draft_csv(manifest);
        let manifest_envelope = add_envelope(&body, DRAFT_CSV_ZLIB)?;
        Ok(ReplayServer {
            node_id,
            manifest_envelope,
            property_values: HashMap::new(),
            force_error_for: None,
        })
    }

    pub fn from_envelope(node_id: NodeId, manifest_envelope: Vec<u8>) -> Result<Self, Error> {
        // validate it decodes before accepting it as a fixture
        let body = parse_envelope(&manifest_envelope)?;
        parse_manifest_draft_csv(&body)?;
        Ok(ReplayServer {
            node_id,
            manifest_envelope,
            property_values: HashMap::new(),
            force_error_for: None,
        })
    }

    pub fn seed_property(&mut self, index: u8, raw_value: Vec<u8>) {
        self.property_values.insert(index, raw_value);
    }

    pub fn force_error(&mut self, opcode: u8, error_code: ErrorCode) {
        self.force_error_for = Some((opcode, error_code));
    }

    /// Answer every request arriving on `transport` until it is closed.
    /// Requests addressed to a different node are ignored, mirroring a
    /// real shared bus.
    pub async fn run<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        loop {
            let frame = transport.receive(None).await?;
            if let Some(response) = self.handle(&frame)? {
                transport.send(response).await?;
            }
        }
    }

    /// Process one request frame, returning the response to send (if any).
    pub fn handle(&mut self, frame: &Frame) -> Result<Option<Frame>, Error> {
        let (node_id, index, opcode, direction) = match unpack_id(frame.id()) {
            Ok(v) => v,
            Err(e) => {
                warn!("replay server ignoring malformed frame: {e}");
                return Ok(None);
            }
        };

        if node_id != self.node_id || direction != Direction::ClientToDevice {
            return Ok(None);
        }

        if let Some((forced_opcode, error_code)) = self.force_error_for {
            if forced_opcode == opcode as u8 {
                return Ok(Some(make_error_response(node_id, index, opcode, error_code)?));
            }
        }

        let response = match opcode {
            Opcode::ReadManifest => {
                let segment = index as usize;
                let start = segment * SEGMENT_SIZE;
                let end = (start + SEGMENT_SIZE).min(self.manifest_envelope.len());
                let payload = if start >= self.manifest_envelope.len() {
                    Vec::new()
                } else {
                    self.manifest_envelope[start..end].to_vec()
                };
                make_read_manifest_response(node_id, index, payload)?
            }
            Opcode::ReadProperty => {
                // Unseeded properties get a random value on first read, matching
                // the reference test server rather than a fixed zero.
                let value = self
                    .property_values
                    .entry(index)
                    .or_insert_with(|| rand::random::<u16>().to_le_bytes().to_vec())
                    .clone();
                make_read_property_response(node_id, propcan::model::PropertyIndex::new(index)?, value)?
            }
            Opcode::WriteProperty => {
                self.property_values.insert(index, frame.data().to_vec());
                make_write_property_response(
                    node_id,
                    propcan::model::PropertyIndex::new(index)?,
                    frame.data().to_vec(),
                )?
            }
            Opcode::Error => {
                error!("replay server received an ERROR frame from a client, ignoring");
                return Ok(None);
            }
        };

        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propcan::codec::{make_read_property_request, unpack_id};

    #[tokio::test]
    async fn loopback_pair_delivers_frames_in_both_directions() {
        let (mut a, mut b) = loopback_pair();
        let frame = Frame::new(0x1234, vec![1, 2, 3]);
        a.send(frame.clone()).await.unwrap();
        let received = b.receive(None).await.unwrap();
        assert_eq!(received, frame);
    }

    #[test]
    fn replay_server_answers_read_property_for_its_own_node() {
        let node_id = NodeId::new(4).unwrap();
        let manifest = Manifest::new("Empty".to_string(), Vec::new());
        let mut server = ReplayServer::new(node_id, &manifest).unwrap();
        server.seed_property(1, vec![0xAB, 0xCD]);

        let index = propcan::model::PropertyIndex::new(1).unwrap();
        let request = make_read_property_request(node_id, index).unwrap();
        let response = server.handle(&request).unwrap().expect("expected a response");

        let (_, _, opcode, direction) = unpack_id(response.id()).unwrap();
        assert_eq!(opcode, Opcode::ReadProperty);
        assert_eq!(direction, Direction::DeviceToClient);
        assert_eq!(response.data(), &[0xAB, 0xCD]);
    }

    #[test]
    fn replay_server_ignores_requests_for_other_nodes() {
        let node_id = NodeId::new(4).unwrap();
        let other_node = NodeId::new(9).unwrap();
        let manifest = Manifest::new("Empty".to_string(), Vec::new());
        let mut server = ReplayServer::new(node_id, &manifest).unwrap();

        let index = propcan::model::PropertyIndex::new(1).unwrap();
        let request = make_read_property_request(other_node, index).unwrap();
        assert!(server.handle(&request).unwrap().is_none());
    }
}
