//! Rampart - Multi-dimensional admission control
//!
//! This crate decides, per incoming request, whether to admit it or reject it
//! with a back-off. Requests are weighed on several axes at once: raw volume,
//! behavioral abuse signals, analysis cost, predicted near-future load and
//! client geography. Counters live in memory or in Redis so several instances
//! can share them.

pub mod abuse;
pub mod analysis;
pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod geo;
pub mod identity;
pub mod penalty;
pub mod predictive;
pub mod quota;
pub mod store;

pub use crate::config::RampartConfig;
pub use crate::decision::{Decision, Dimension};
pub use crate::engine::{Admission, AdmissionEngine, AdmissionRequest};
pub use crate::error::{RampartError, Result};
pub use crate::identity::ClientIdentity;
