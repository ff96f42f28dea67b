//! End-to-end tests for the runner proxy.
//!
//! These drive the task translator, event pipeline, and callback server
//! through their public APIs, using a scripted RPC client in place of a real
//! Forge and either a trivial real binary or direct HTTP calls in place of a
//! real Worker subprocess.

#![deny(clippy::invalid_regex)]

mod helper;

mod action_download_info;
mod poller_once_mode;
mod skip_by_if;
mod worker_exit;
