//! Trawl - query and live-streaming gateway for captured network traffic
//!
//! This crate sits between UI clients and an entry store. It serves
//! paginated history, streams matching entries live over WebSockets,
//! replays captured HTTP requests and feeds captured items into the store.

pub mod classify;
pub mod config;
pub mod entries;
pub mod entry;
pub mod error;
pub mod ingest;
pub mod replay;
pub mod server;
pub mod store;
pub mod stream;
pub mod testing;

pub use error::TrawlError;
