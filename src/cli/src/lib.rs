//! imgcrypt CLI - push and pull encrypted container images.

pub mod commands;
pub mod output;
