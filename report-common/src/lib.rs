pub mod dynamo;
pub mod metrics;
pub mod report;
pub mod store;
pub mod timestamp;
