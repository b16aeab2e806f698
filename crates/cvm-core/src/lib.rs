//! cvm-core: Shared protocol library for the CollabVM relay.
//!
//! Provides the binary message envelope exchanged with browser viewers,
//! its CBOR codec, and the error type shared by the server crates.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode};
pub use error::{CvmError, CvmResult};
pub use messages::{ControllerStatus, Message, RegionEncoding, Role, SUBPROTOCOL};
