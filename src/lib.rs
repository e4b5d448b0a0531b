//! Live timing monitor that reconciles a polled, append-only event feed into
//! a consistent per-driver standings table.

pub mod config;
pub mod export;
pub mod extract;
pub mod feed;
pub mod model;
pub mod monitor;
pub mod reconcile;
pub mod registry;
pub mod render;
pub mod scheduler;
