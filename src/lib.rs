pub mod api;
pub mod bootstrap;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod middleware;
pub mod server;
pub mod settlement;
