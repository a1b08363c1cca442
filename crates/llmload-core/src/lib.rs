pub mod collector;
pub mod config;
pub mod executor;
pub mod generator;
pub mod report;
pub mod scheduler;
pub mod schema;
pub mod stream;
pub mod sweep;
pub mod util;
