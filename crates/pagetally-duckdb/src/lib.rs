pub mod auth;
pub mod backend;
pub mod export;
pub mod hits;
pub mod schema;
pub mod stats;
pub mod store_impl;
pub mod website;

pub use backend::DuckDbBackend;
