//! Engine crates for the rtbench harness: the tester's load-generation
//! engine, the collector's result ingestion pipeline, and the mock's
//! latency-injection engine, plus the control plane they share.

pub mod collector;
pub mod config;
pub mod error;
pub mod middleware;
pub mod mock;
pub mod service;
pub mod tester;
pub mod tls;
pub mod types;

pub use error::{Error, Result};
