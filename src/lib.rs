//! Remote compile-and-run relay.
//!
//! A client sends a filename and source text over TCP; the server writes it to
//! a scratch file, compiles and optionally runs it with the toolchain
//! registered for its extension, and answers with one transcript.

pub mod cli;
pub mod client;
pub mod config;
pub mod handler;
pub mod pipeline;
pub mod printer;
pub mod process;
pub mod protocol;
pub mod server;
pub mod toolchain;
