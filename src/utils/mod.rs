//! Utility functions and helpers

pub mod time;

pub use time::{describe_time, get_current_time};
