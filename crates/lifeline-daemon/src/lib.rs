#![allow(clippy::doc_markdown)]
#![allow(clippy::too_long_first_doc_paragraph)]

//! lifeline-daemon - LifeLine emergency lifecycle daemon library.
//!
//! Wires the [`lifeline_core`] model to a store, a helper geo index and a
//! notification sink, and exposes the result over HTTP.
//!
//! # Runtime Requirements
//!
//! The `SQLite` store runs queries on tokio's blocking pool, so the service
//! needs a runtime with blocking threads (the default for
//! `#[tokio::main]` and `#[tokio::test]`).
//!
//! # Modules
//!
//! - [`service`]: `LifecycleService`, the orchestration of every lifecycle
//!   operation (locking, optimistic-concurrency retries, timeouts,
//!   notifications)
//! - [`locks`]: per-emergency async lock registry
//! - [`api`]: axum router, extractors and error mapping
//! - [`metrics`]: Prometheus metrics

pub mod api;
pub mod locks;
pub mod metrics;
pub mod service;

pub use service::{LifecycleService, NearbyEmergency, ServiceConfig, SosOutcome};
