//! The OFDPA group-chain controller.
//!
//! Translates next objectives into chains of hardware groups, installs those chains in
//! dependency order against a device's group table, and reports each objective's outcome once
//! its top-level group is confirmed.

pub mod app;
pub mod chain;
pub mod config;
pub mod ctl;
pub mod database;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod ident;
pub mod models;
pub mod pending;
pub mod replay;
pub mod server;
pub mod service;
pub mod store;
pub mod utils;
#[cfg(test)]
mod utils_test;
