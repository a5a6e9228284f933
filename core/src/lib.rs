pub mod api;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod funding;
pub mod ledger;
pub mod locks;
pub mod notification;
pub mod request;
pub mod retry;
pub mod rng;
pub mod stats;
pub mod store;
pub mod types;
