pub mod app;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod index;
pub mod output;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod sync;
