//! WAGER: peer-to-peer bet escrow and settlement service
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod registry;
pub mod ledger;
pub mod engine;
pub mod storage;
pub mod api;
