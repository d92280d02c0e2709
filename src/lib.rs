//! Parking-lot occupancy from uploaded video.
//!
//! Videos are sampled frame by frame, vehicles are detected on each sampled
//! frame, detections are mapped onto configured slot polygons and debounced
//! into confirmed occupied/free events. Work is distributed to a pool of
//! workers through a leased job queue, and every run checkpoints so it can
//! resume after a crash.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
