pub mod audit;
pub mod config;
pub mod error;
pub mod handlers;
pub mod persister;
pub mod planner;
pub mod publisher;
pub mod resolver;
pub mod time;
pub mod writer;
