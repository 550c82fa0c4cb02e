//! Frame transport abstraction (spec §4.A). Bus-agnostic: any transport
//! supplying whole, FIFO-ordered frames can drive the protocol above it.

use async_trait::async_trait;
use std::time::Instant;

/// One atomic bus message: a 29-bit ID plus 0..=8 data bytes.
///
/// Frames are immutable after construction and short-lived: they are
/// consumed by a state machine and then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= 8, "frame payload must be 0..=8 bytes");
        Frame { id, data }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Capability object for a duplex frame transport (spec §9: dynamic
/// dispatch over transports replaces the source's abstract base class).
///
/// Implementations guarantee: frames are delivered whole, never split or
/// coalesced; the transport does not filter by ID; ordering is FIFO per
/// direction.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> crate::Result<()>;

    /// Receive the next frame observed on the bus. `deadline` is an
    /// absolute instant; `None` blocks indefinitely. On timeout, any
    /// partially consumed bytes inside the transport remain buffered for
    /// the next call.
    async fn receive(&mut self, deadline: Option<Instant>) -> crate::Result<Frame>;
}
