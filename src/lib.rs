pub mod cache;
pub mod capture;
pub mod config;
pub mod logging;
pub mod queue;
pub mod replay;
pub mod storage;
pub mod transport;
pub mod worker;
