//! Agent Launcher — bounded-concurrency launcher for long-running agents.

pub mod agent;
pub mod config;
pub mod error;
pub mod reporter;
pub mod scheduler;
