//! Shared entity types and wire contracts for the Kalpana control plane.
//!
//! This crate is imported by both `kalpana-core` (the control plane
//! process) and `kalpana-executor` (the in-container agent publisher), and
//! is the only crate the two binaries share. It carries no Docker, Mongo,
//! or Redis client code of its own - only the data model from spec §3, the
//! `AgentEvent` wire contract from spec §4.6-§4.7, and small serde-facing
//! helpers.

pub mod entities;
