pub mod config;
pub mod distribution;
pub mod error;
pub mod loader;
pub mod output;
pub mod pipeline;
pub mod publisher;
pub mod repository;
pub mod scheduler;
pub mod selector;
pub mod shutdown;
pub mod store;
pub mod tracker;
pub mod worker;
