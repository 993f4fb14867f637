pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod routes;
pub mod runtime;
pub mod state;
pub mod tenant;
