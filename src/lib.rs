//! cgi-gateway library
//!
//! This crate provides the pieces of an HTTP-to-CGI gateway:
//! - Path resolution from request paths to runnable units
//! - Execution backends (native process, Docker container, wasmtime sandbox)
//! - I/O plumbing and CGI response translation
//! - The per-request engine and its axum front end

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod plumbing;
pub mod resolve;
pub mod server;
pub mod translate;
