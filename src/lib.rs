//! # checkq
//!
//! Checksheet queue coordinator for factory workcenters.
//!
//! Provides a persistent per-workcenter control plan queue (SQLite) that
//! enforces at most one active checksheet per workcenter, a transient
//! broadcast hub that fans state changes out to connected operator
//! terminals, and the dispatch layer that sequences the two.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod hub;
pub mod model;
pub mod queue;
pub mod sse;
pub mod storage;
pub mod telemetry;
