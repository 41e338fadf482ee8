//! Test utilities for the queue service.
//!
//! - [`FaultyRepository`] - in-memory repository with injectable failures
//! - [`fixtures`] - engine builders and request helpers
//! - [`TestQueueServer`] - real HTTP server on a random port

pub mod faulty_repository;
pub mod fixtures;
pub mod server_harness;

pub use faulty_repository::FaultyRepository;
pub use fixtures::*;
pub use server_harness::TestQueueServer;
