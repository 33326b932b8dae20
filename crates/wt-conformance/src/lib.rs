//! Web Thing Conformance Checks
//!
//! This crate drives a running Web Thing server through the protocol's
//! conformance sequence and reports whether it behaves as the protocol
//! requires.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   REST    ┌─────────────────┐
//! │  ConformanceRun  │──────────▶│  Thing under    │
//! │  description     │           │  test (lamp)    │
//! │  properties      │ WebSocket │                 │
//! │  actions/events  │◀─────────▶│                 │
//! │  websocket       │           └─────────────────┘
//! └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use wt_conformance::{ConformanceRun, TargetConfig};
//!
//! let mut run = ConformanceRun::new(TargetConfig::from_env());
//! let ok = run.run().await;
//! run.print_summary();
//! ```

pub mod actions;
pub mod client;
pub mod config;
pub mod description;
mod error;
pub mod events;
pub mod expect;
pub mod harness;
pub mod messages;
pub mod profile;
pub mod properties;
pub mod timestamp;
pub mod websocket;
pub mod ws_client;

pub use config::{ActionEndpoint, CompletionWait, SchemaVersion, Scheme, TargetConfig, WaitMode};
pub use error::{ConformanceError, ConformanceResult};
pub use harness::{ConformanceRun, StageOutcome, StageReport};
pub use profile::DeviceProfile;
