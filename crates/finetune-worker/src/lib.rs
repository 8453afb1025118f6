//! Per-user fine-tuning worker.
//!
//! Claims one pending job, extracts the user's sent mail into a training set,
//! runs the training routine, registers the resulting adapter and points the
//! user at it. Progress lives on the job record; webhooks are best-effort.

pub mod config;
pub mod credentials;
pub mod dataset;
pub mod db;
pub mod deployment;
pub mod error;
pub mod extractor;
pub mod gmail_client;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod reporter;
pub mod schema;
pub mod store;
pub mod tracker;
pub mod training;
pub mod watchdog;

#[cfg(test)]
mod testing;
