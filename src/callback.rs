//! The in-process HTTP/2 server emulating the Azure DevOps "VSSConnection"
//! surface the Worker subprocess calls back into: timeline updates, the live
//! log feed, action-download resolution, an artifact cache passthrough, the
//! job request endpoint, and the cancellation long-poll.

pub mod actions;
pub mod cache;
pub mod server;

pub use server::{CallbackServer, Event, TimelineRecord};

/// Errors possibly surfaced standing up or running the callback server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding the ephemeral listener failed.
    #[error("bind callback server listener")]
    Bind,
}
