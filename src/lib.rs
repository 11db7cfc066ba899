pub mod batch;
pub mod config;
pub mod cursor;
pub mod discovery;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod runner;
pub mod storage;
pub mod tracker;
