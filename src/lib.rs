//! Vehicle ledger: an append-only, proof-of-work chained ledger for
//! vehicle-to-vehicle messages.
//!
//! - [`blockchain`] - blocks, hashing, proof of work, the ledger and its storage
//! - [`api`] - HTTP endpoints vehicle nodes use to reach the ledger
//! - [`config`] - runtime configuration

#![forbid(unsafe_code)]

pub mod api;
pub mod blockchain;
pub mod config;
