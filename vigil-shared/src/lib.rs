#![cfg_attr(not(test), forbid(unsafe_code))]

//! Shared models, wire normalization, staleness policy, error taxonomy and
//! configuration for the Vigil location reconciliation engine.

pub mod config;
pub mod errors;
pub mod models;
pub mod staleness;
