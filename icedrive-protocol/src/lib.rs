//! Shared types, wire formats, and ticket encoding for icedrive blob nodes.

pub mod query;
pub mod ticket;
pub mod types;
