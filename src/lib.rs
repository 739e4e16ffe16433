//! Post enrichment pipeline
//!
//! Fans the images of a post out to independent analysis stages over a
//! Redis Streams bus, tracks completion per post, merges stage results into
//! one deterministic aggregated record, and notifies the search indexer.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
