pub mod collector;
pub mod config;
pub mod detector;
pub mod monitor;
pub mod notifier;
pub mod report;
