//! Resolver plugins, in the order they are normally registered.

pub mod adblock;
pub mod cache;
pub mod doh;
pub mod forward;
