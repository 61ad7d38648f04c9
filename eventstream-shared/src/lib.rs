#![cfg_attr(not(test), forbid(unsafe_code))]

//! Shared configuration and wire models for the `EventStream` server.

pub mod config;
pub mod models;
