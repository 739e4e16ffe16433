pub mod aggregator;
pub mod analysis;
pub mod bus;
pub mod consumer;
pub mod dispatcher;
pub mod memory_bus;
pub mod merge;
pub mod replay;
pub mod retry;
pub mod rules;
pub mod stages;
pub mod sync;
pub mod tracker;
pub mod worker;
