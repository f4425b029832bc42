//! Parallel worker orchestration.
//!
//! [`spawner`] launches one OS process per [`types::LaunchRequest`],
//! [`monitor`] supervises the resulting handles until they are all terminal,
//! and [`collector`] turns them into a consolidated handoff.
//! [`group_runner`] wires the three together behind a
//! [`circuit_breaker::CircuitBreaker`].

pub mod circuit_breaker;
pub mod collector;
pub mod group_runner;
pub mod monitor;
pub mod spawner;
pub mod types;
