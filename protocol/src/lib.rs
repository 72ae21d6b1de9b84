//! Wire protocol shared by the Gateway and Datastore processes.
//!
//! Frames are pipe-delimited UTF-8 strings exchanged over a single duplex
//! Unix-domain socket. See [`codec`] for encoding/decoding, [`schema`] for
//! the five message types and their argument/field lists, [`error`] for the
//! error taxonomy carried on the wire, and [`transport`] for the
//! correlation-id based request/response fabric used by the initiator side.

pub mod codec;
pub mod error;
pub mod framing;
pub mod schema;
pub mod transport;

pub use codec::{DecodedRequest, DecodedResponse};
pub use error::CoreError;
pub use framing::{read_frame, write_frame};
pub use schema::{Lane, MessageType};
pub use transport::Transport;

/// Default request/response timeout, per §4.2 / `ZMQ_TIMEOUT_MS`.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default send/receive high-water mark, per §4.2.
pub const DEFAULT_HIGH_WATER_MARK: usize = 1000;
