//! Ultravox CLI Library Crate
//!
//! Configuration, argument handling and the interactive console for the
//! `ultravox-cli` binary, which is a thin wrapper around this library.

pub mod cli;
pub mod config;
pub mod console;
pub mod tools;
