pub mod auth;
pub mod authz;
pub mod config;
pub mod credit;
pub mod db;
pub mod error;
pub mod flags;
pub mod loyalty;
pub mod model;
pub mod routes;
pub mod store;
