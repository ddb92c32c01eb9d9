#![forbid(unsafe_code)]

//! Public entry point for the Bilibili comment collection crate.
//!
//! The library holds everything the two binaries share: the paginated
//! fetcher, the flat comment store and tree reconstruction, the published
//! record shape, and the job tracker that pollers query while a crawl runs.

pub mod api;
pub mod artifact;
pub mod comment;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod identifier;
pub mod jobs;
pub mod pipeline;
pub mod transcode;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;
