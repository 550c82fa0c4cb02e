//! Device-property access protocol core: wire protocol, codecs, and state
//! machines for discovering bus nodes and reading/writing their typed
//! properties. Bus-agnostic — see [`frame::Transport`] for the one trait
//! a concrete transport (e.g. `propcan-ocarina`, `propcan-serialcan`) must
//! implement.

pub mod client;
pub mod codec;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod manifest;
pub mod model;
pub mod state_machine;
pub mod value;

pub use error::{Error, Result};
pub use frame::{Frame, Transport};
