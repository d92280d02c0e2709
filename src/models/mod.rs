pub mod detection;
pub mod job;
pub mod lot;
pub mod occupancy;
pub mod video;
