//! Core domain types
//!
//! These types describe a single builder run: what is being built, which
//! workers were brought up to build it, and how each version fared.

pub mod run;
pub mod target;
pub mod worker;
