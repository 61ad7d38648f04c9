//! # Configuration
//!
//! This module contains the configuration structures for the server and
//! the stream engine, along with the loader that merges files, environment
//! variables and command-line overrides.

pub mod server;
