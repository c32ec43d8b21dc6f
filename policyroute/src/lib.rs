//! Rule-based traffic classification: rule sets, policy groups and node
//! health, resolved into a per-connection routing action.

pub mod cli;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod external;
