//! Resource-aware admission, queue promotion and stall monitoring for
//! concurrent download/upload jobs.

pub mod admission;
pub mod classifier;
pub mod config;
pub mod constants;
pub mod error;
pub mod format;
pub mod health;
pub mod monitor;
pub mod notify;
pub mod promotion;
pub mod resource;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod utils;
