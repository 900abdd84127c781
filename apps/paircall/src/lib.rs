pub mod broadcast;
pub mod config;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod telemetry;
pub mod transport;
