//! Service façade for the Keystone coordinator.
//!
//! Translates wire-layer requests into transaction manager operations,
//! one-to-one, returning typed errors. See [`facade`].

pub mod facade;

pub use facade::{TransactionService, TxRequest, TxResponse};
