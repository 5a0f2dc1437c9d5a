//! Finance Service - tenant rent ledger with mobile-money payment reconciliation.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
