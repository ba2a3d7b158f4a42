pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod installer;
pub mod manifest;
pub mod registry;
pub mod store;
pub mod task;
