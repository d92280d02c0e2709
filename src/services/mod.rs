pub mod debouncer;
pub mod detection;
pub mod media;
pub mod memory;
pub mod processor;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod sampler;
pub mod scheduler;
pub mod store;
