//! tsh-core: Shared protocol library for tsh (tunnelled shell).
//!
//! Provides the shell multiplexing message types, the CBOR codec, the error
//! taxonomy and the abstract transport traits used by the device daemon.

pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, MAX_FRAME_SIZE};
pub use error::{TshError, TshResult};
pub use message::{MessageStatus, MessageType, ShellMessage};
pub use transport::{Dialer, FrameReader, FrameWriter};
