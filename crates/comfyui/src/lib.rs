//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper for a single local ComfyUI server,
//! typed history parsing, the submit-and-poll execution tracker and
//! the artifact fetcher used by the serverless worker.

pub mod api;
pub mod artifact;
pub mod history;
pub mod tracker;
