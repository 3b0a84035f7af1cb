pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod flush;
pub mod hit;
pub mod memstore;
pub mod session;
pub mod store;
