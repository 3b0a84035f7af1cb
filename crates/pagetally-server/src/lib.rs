pub mod app;
pub mod auth;
pub mod error;
pub mod extract;
pub mod import;
pub mod jobs;
pub mod replay;
pub mod routes;
pub mod state;
