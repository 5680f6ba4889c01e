pub mod clock;
pub mod config;
pub mod engine;
pub mod filter;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod retry;
pub mod store;
