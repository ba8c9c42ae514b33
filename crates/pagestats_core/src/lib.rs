pub mod config;
pub mod fetch;
pub mod report;
pub mod runtime;
pub mod session;
pub mod snapshot;
pub mod stats;
