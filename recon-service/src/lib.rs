//! Reconciliation service - matches app-side transactions against gateway
//! records and settles orders against their payments.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
