pub mod anomaly;
pub mod decision;
pub mod engine;
pub mod session;
