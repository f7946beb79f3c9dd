//! # periph-cli
//!
//! Command-line interface for periph.
//!
//! ## Commands
//!
//! - `periph serve`: answer newline-delimited JSON tool calls on stdio
//! - `periph tools`: list the advertised tools
//! - `periph devices`: list devices of the enabled classes
//! - `periph call`: run a single tool call
//! - `periph config`: show the effective configuration
//! - `periph doctor`: validate the configuration and probe external programs

pub mod commands;

pub use commands::Cli;
