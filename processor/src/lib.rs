pub mod config;
pub mod downtime_ledger;
pub mod interruption_handler;
pub mod inventory;
pub mod notice_runner;
pub mod pool_risk;
pub mod provider;
pub mod replica_lifecycle;
pub mod sweeper;
