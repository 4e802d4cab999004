pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logs;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
