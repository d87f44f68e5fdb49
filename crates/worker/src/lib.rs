//! `indus-worker` library crate.
//!
//! Serverless worker that starts a local ComfyUI server, waits for it
//! to become healthy and then turns queued workflow jobs into
//! base64-encoded images. The binary entrypoint lives in `main.rs`.

pub mod assets;
pub mod bootstrap;
pub mod config;
pub mod handler;
pub mod listener;
pub mod relay;
pub mod supervisor;
