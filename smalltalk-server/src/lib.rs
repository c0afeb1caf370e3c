// Library crate exposing the application modules so integration tests and binaries can share code.
pub mod config;
pub mod daily;
pub mod email;
pub mod generator;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod repository;
pub mod startup;
pub mod topics;
