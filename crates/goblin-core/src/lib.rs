pub mod config;
pub mod execution;
pub mod gadgets;
pub mod ledger;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod results;
