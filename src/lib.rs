pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod fare;
pub mod pipeline;
pub mod recognition;
pub mod reconcile;
pub mod session;
pub mod state;
