//! Task run scheduling core: priority run queue, per-run context isolation,
//! run status lifecycle, and the durable status log.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod processor;
pub mod run;
pub mod scheduler;
pub mod show;
pub mod store;
pub mod task;
pub mod trace;
