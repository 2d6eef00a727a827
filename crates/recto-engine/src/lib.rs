//! recto-engine: background execution for the recto correction pipeline.
//!
//! `recto-pipeline` is sans-IO; this crate supplies the rest of the
//! runtime: loading scans from disk, a worker pool that executes one
//! processing chain per page, cooperative cancellation, and delivery of
//! result commands back to the interactive context over a channel.
//!
//! Stages of a single page never run concurrently — a chain executes
//! start to finish on one worker. Different pages fan out across the
//! pool, and their deliveries arrive in completion order.

pub mod batch;
pub mod load;

pub use batch::{Delivery, Engine, EngineError};
pub use load::{describe_page, load_source};
