pub mod cron;
pub mod handler;
pub mod models;
pub mod orders;
pub mod payouts;

pub use handler::AppState;
