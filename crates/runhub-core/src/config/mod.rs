//! Configuration for the runhub daemon
//!
//! Configuration is read from a YAML file. Every field has a default, so an empty
//! document describes a complete plaintext setup suitable for local use.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;
