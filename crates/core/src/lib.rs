//! Shared types for the Indus serverless worker.
//!
//! Holds the job payload shapes exchanged with the job queue and the
//! validation that turns a raw job into a submittable work unit. This
//! crate performs no I/O.

pub mod error;
pub mod job;
