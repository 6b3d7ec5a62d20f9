//! Tiled detection pipeline for beehive frame photos
//!
//! Large photos are cut into a grid of tiles, each tile is sent to a detection
//! backend, and the per-tile boxes are mapped back to whole-image coordinates
//! and merged into one detection record per photo. Work is driven by a durable
//! PostgreSQL job queue polled by independent worker loops.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
