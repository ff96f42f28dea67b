//! The library module for the runner proxy.
//!
//! This crate is intended to be used in binary form only, and this library
//! may exhibit breaking changes in any release.
//!
//! The intent for this library is to support shared functionality between
//! binaries exported by this crate, along with better supporting testing.

pub mod callback;
pub mod config;
pub mod daemon;
pub mod doc;
pub mod error_ext;
pub mod events;
pub mod ext;
pub mod logging;
pub mod poller;
pub mod rpc;
pub mod task;
