//! Subpool - multi-tenant proxy subscription aggregator
//!
//! Each tenant group owns a secret token and a list of data sources. A
//! subscription request fetches the group's remote sources concurrently,
//! merges them with inline nodes, filters and de-duplicates the result, and
//! serves it as base64 or delegates it to an external conversion backend for
//! client-specific formats.

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod format;
pub mod group;
pub mod pipeline;
pub mod policy;
pub mod response;
pub mod server;
pub mod token;

pub use error::SubpoolError;
