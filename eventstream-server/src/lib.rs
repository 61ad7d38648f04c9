#![cfg_attr(not(test), forbid(unsafe_code))]

//! `EventStream` server: Server-Sent Events fan-out with durable per-channel
//! catch-up and live tail.

pub mod app_state;
pub mod auth;
mod handlers;
pub mod http;
pub mod middleware;
pub mod openapi;
mod routes;
pub mod server;
pub mod services;
mod tracer;
