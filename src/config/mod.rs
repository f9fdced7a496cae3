//! Configuration module
//!
//! Loads the optional relay configuration file.

mod relay;

pub use relay::*;
