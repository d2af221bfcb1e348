//! Notification Settlement - metered, idempotent delivery of scheduled safety notifications.
//!
//! This library provides the quota ledger, task engine, reminder
//! reconciliation and queue worker behind the notification pipeline.

pub mod cache;
pub mod config;
pub mod contacts;
pub mod delivery;
pub mod dispatch;
pub mod ledger;
pub mod messages;
pub mod reconcile;
pub mod store;
pub mod templates;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;
