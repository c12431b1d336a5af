pub mod agreement;
pub mod api;
pub mod blockchain;
pub mod config;
pub mod contract;
pub mod error;
pub mod insight;
pub mod ledger;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod token;
pub mod transaction;
pub mod units;
pub mod utils;
pub mod wallet;
