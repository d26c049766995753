//! Shared types for the vidbench streaming harness.
//!
//! This crate contains:
//! - **Manifest model** — quality ladder and segment layout, loaded once per scenario
//! - **Network profiles** — scenario parameters and their validation
//! - **Wire format** — datagrams of the UDP segment transport
//! - **ID generation** — Prefixed UUIDv7 helpers (`run_`, `ses_`)

pub mod ids;
pub mod manifest;
pub mod profile;
pub mod wire;
