pub mod error;
pub mod models;
pub mod p2p;
