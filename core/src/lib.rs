//! Core library for meshd - decentralized cluster-membership and
//! lightweight-messaging engine.
//!
//! # Architecture
//! - `clock`: Lamport clocks (status / event / query)
//! - `member`: member store and per-member state machine
//! - `query`: outbound query tracking and the internal (`_mesh_`) router
//! - `node`: `Create` / `Join` / `Leave` / `Shutdown` orchestration
//!
//! Logging goes through `tracing` spans emitted by each subsystem; there is
//! no process-wide logger singleton here — the embedding application installs
//! whatever `tracing` subscriber it wants.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod clock;
pub mod codec;
pub mod coalesce;
pub mod conflict;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod event;
pub mod intent;
pub mod keymanager;
pub mod member;
pub mod node;
pub mod query;
pub mod reaper;
pub mod snapshot;
pub mod transport;

pub use clock::LamportClock;
pub use config::Config;
pub use error::{MeshError, Result};
pub use member::{Member, MemberStatus, MemberStore};
pub use node::Node;
