//! Mail Dispatch: turns whitelisted emails into queued commands.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod parser;
pub mod queue;
pub mod rate_limit;
