//! clipferry library
//!
//! This library provides the core functionality for the clipferry bot:
//! link intake, two-tier content extraction, bounded media transfer, and
//! delivery back into chat.

pub mod cli;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod governor;
pub mod links;
pub mod logging;
pub mod pipeline;
pub mod telegram;
pub mod transfer;
