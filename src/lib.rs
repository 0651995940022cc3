//! Binance P2P market dashboard.
//!
//! Polls the P2P ad search and spot price sources, scores a BUY/SELL/HOLD
//! recommendation, and serves it with price anomalies over HTTP and a
//! websocket channel.

pub mod config;
pub mod dashboard;
pub mod data;
pub mod market;
pub mod monitoring;
pub mod poller;
pub mod strategy;
