// ===============================
// src/lib.rs
// ===============================
pub mod backtest;
pub mod broker;
pub mod broker_alpaca;
pub mod broker_mock;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod executor;
pub mod metrics;
pub mod momentum;
pub mod pipeline;
pub mod portfolio;
pub mod rate_limiter;
pub mod recorder;
pub mod risk;
pub mod valuation;
