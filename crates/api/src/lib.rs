//! `giftwell-api` — JSON entry points for the sync core and the job
//! engine, plus the service wiring behind them.

pub mod app;
pub mod config;
pub mod services;
