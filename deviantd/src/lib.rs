pub mod config;
pub mod job;
pub mod sync;
pub mod token_provider;
