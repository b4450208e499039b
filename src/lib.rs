//! # obsched
//!
//! Autonomous astronomical observation scheduler core.
//!
//! This crate implements the control loop of an unattended observatory: it
//! ranks a queue of observation jobs against temporal and environmental
//! constraints, selects the best candidate, and drives its multi-stage
//! execution (slew, focus, align, guide, capture) through narrow device
//! collaborator interfaces, detecting stalls and deciding
//! retry/abort/advance/re-evaluate transitions.
//!
//! ## Architecture
//!
//! - [`models`]: job description and run state, targets, capture signatures
//! - [`devices`]: typed capability traits per device family plus simulated
//!   implementations for tests and the demo daemon
//! - [`ephemeris`]: altitude/twilight collaborator interface
//! - [`scheduler`]: greedy selection engine, module state registry, and the
//!   iteration driver state machine
//! - [`services`]: queue persistence, duration estimation, user-visible log
//!
//! The whole scheduler advances in a single flow of control: a self-rearming
//! single-shot timer drives iterations, and device status notifications are
//! delivered on the same event queue. No locks protect the core state because
//! nothing else touches it.

pub mod config;
pub mod devices;
pub mod ephemeris;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod services;

pub use config::SchedulerOptions;
pub use error::SchedulerError;
