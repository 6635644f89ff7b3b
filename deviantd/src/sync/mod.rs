pub mod backoff;
pub mod engine;
pub mod legacy;
pub mod library;
pub mod paths;
pub mod reconcile;
pub mod resolver;
pub mod store;
pub mod transfer;
