//! Core types and traits for the PeerMesh orchestrator.
//!
//! This crate defines the data structures shared by the wire layer and the
//! kernel: envelopes, peer status, the component contract, configuration and
//! errors. It contains no I/O.

pub mod component;
pub mod config;
pub mod envelope;
pub mod error;
pub mod peer;
