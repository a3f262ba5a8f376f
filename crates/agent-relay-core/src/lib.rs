//! Core types, config, and errors for Agent Relay.

pub mod config;
pub mod error;
pub mod protocol;
pub mod run;
