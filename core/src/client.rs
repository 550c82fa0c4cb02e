//! Client facade: enumerate nodes, and get/set/query their properties
//! (spec §4.K).

use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::codec::{make_read_manifest_request, unpack_id};
use crate::driver::drive;
use crate::envelope::parse_envelope;
use crate::frame::Transport;
use crate::manifest::{Manifest, Property};
use crate::model::{Direction, NodeId, Opcode, PropertyIndex};
use crate::state_machine::{ManifestDownload, PropertyQuery, StateMachine};
use crate::value::{decode_value, encode_value};
use crate::Error;

/// A discovered bus node: its address plus its decoded manifest.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: NodeId,
    pub manifest: Manifest,
}

impl Node {
    pub fn address_str(&self) -> String {
        self.node_id.to_string()
    }

    pub fn name(&self) -> String {
        format!("{}@{}", self.manifest.device_name, self.address_str())
    }

    pub fn get_property_path(&self, property: &Property) -> String {
        format!("{}/{}", self.name(), property.name)
    }
}

/// A single request batched through `Client::query_properties`.
pub enum PropertyRequest {
    Get(PropertyIndex),
    Set(PropertyIndex, Vec<u8>),
}

pub struct Client<T: Transport> {
    transport: T,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Client { transport }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Broadcast a segment-0 manifest read to every legal node ID, collect
    /// replies until `timeout` elapses, then sequentially download and
    /// parse each candidate's full manifest. A per-node protocol error (or
    /// any other failure) is logged and that node is skipped — one
    /// misbehaving node must not abort the scan.
    pub async fn enumerate_nodes(&mut self, timeout: Duration) -> Result<Vec<Node>, Error> {
        info!("begin bus scan");

        for node_id in NodeId::all() {
            let frame = make_read_manifest_request(node_id, 0)?;
            self.transport.send(frame).await?;
        }

        let deadline = Instant::now() + timeout;
        let mut candidates: Vec<(NodeId, crate::frame::Frame)> = Vec::new();

        loop {
            match self.transport.receive(Some(deadline)).await {
                Ok(frame) => match unpack_id(frame.id()) {
                    Ok((node_id, 0, Opcode::ReadManifest, Direction::DeviceToClient)) => {
                        candidates.push((node_id, frame));
                    }
                    Ok(_) => {}
                    Err(e) => error!("protocol error while scanning: {e}"),
                },
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        info!("found {} candidate nodes, downloading manifests", candidates.len());

        let mut nodes = Vec::new();
        for (node_id, initial_reply) in candidates {
            let mut md = ManifestDownload::new(node_id);
            if let Err(e) = md.frame_received(&initial_reply) {
                error!("protocol error for node {node_id}: {e}");
                continue;
            }

            let per_node_deadline = Instant::now() + timeout;
            match drive(&mut self.transport, &mut md, per_node_deadline).await {
                Ok(()) => {
                    let envelope = md.into_manifest_envelope();
                    match parse_envelope(&envelope).and_then(|body| {
                        crate::manifest::parse_manifest_draft_csv(&body)
                    }) {
                        Ok(manifest) => nodes.push(Node { node_id, manifest }),
                        Err(e) => error!("failed to parse manifest for node {node_id}: {e}"),
                    }
                }
                Err(Error::Protocol(msg)) => error!("protocol error for node {node_id}: {msg}"),
                Err(e) => error!("error downloading manifest for node {node_id}: {e}"),
            }
        }

        info!("finished bus scan");
        Ok(nodes)
    }

    pub async fn get_property(
        &mut self,
        node: &Node,
        property: &Property,
        timeout: Duration,
    ) -> Result<f64, Error> {
        let index = PropertyIndex::new(property.index)?;
        let mut pq = PropertyQuery::new_read(node.node_id, index);
        drive(&mut self.transport, &mut pq, Instant::now() + timeout).await?;
        let raw = pq.into_value().expect("drive() only returns Ok once finished");
        decode_value(property, &raw)
    }

    pub async fn set_property(
        &mut self,
        node: &Node,
        property: &Property,
        value: f64,
        timeout: Duration,
    ) -> Result<f64, Error> {
        let encoded = encode_value(property, value)?;
        let index = PropertyIndex::new(property.index)?;
        let mut pq = PropertyQuery::new_write(node.node_id, index, encoded);
        drive(&mut self.transport, &mut pq, Instant::now() + timeout).await?;
        let raw = pq.into_value().expect("drive() only returns Ok once finished");
        debug!("{} <-- echoed raw value", property.name);
        decode_value(property, &raw)
    }

    /// Run one `PropertyQuery` per `(node, property, request)` triple, with
    /// a fresh per-entry deadline. A failed entry appends `None` rather
    /// than aborting the batch.
    pub async fn query_properties(
        &mut self,
        requests: Vec<(NodeId, PropertyRequest)>,
        timeout: Duration,
    ) -> Result<Vec<Option<Vec<u8>>>, Error> {
        let mut results = Vec::with_capacity(requests.len());

        for (node_id, request) in requests {
            let mut pq = match request {
                PropertyRequest::Get(index) => PropertyQuery::new_read(node_id, index),
                PropertyRequest::Set(index, value) => PropertyQuery::new_write(node_id, index, value),
            };

            match drive(&mut self.transport, &mut pq, Instant::now() + timeout).await {
                Ok(()) => results.push(pq.into_value()),
                Err(e) => {
                    error!("protocol error for node {node_id}: {e}");
                    results.push(None);
                }
            }
        }

        Ok(results)
    }
}
