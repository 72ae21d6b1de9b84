//! The client-facing stream handle (§2, §6). The accept loop and HTTP
//! upgrade negotiation that produce this handle are treated as an external
//! collaborator, out of scope for the core (§1) — the Orchestrator only
//! needs the contract below.

use rsvoice_protocol::CoreError;

pub trait ClientStream: Send + Sync {
    /// Forward a raw upstream frame to the client. A failure here means the
    /// client is gone; the Orchestrator reacts by cleaning up the session.
    fn send(&self, raw: &str) -> Result<(), CoreError>;
}
