pub mod accumulator;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod reconcile;
pub mod retry;
pub mod sink;
pub mod stream;
pub mod telemetry;
pub mod transport;
#[cfg(test)]
pub mod test_util;
