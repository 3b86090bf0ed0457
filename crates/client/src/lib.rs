//! Client-side orchestration for the Keystone coordinator.
//!
//! - [`TransactionParticipant`] — the capability set a resource implements
//!   to take part in transactions
//! - [`TransactionContext`] — drives participants through one
//!   start/finish/abort lifecycle, escalating rollback failures to
//!   invalidation
//! - [`TransactionExecutor`] — runs closures transactionally with
//!   pluggable retry (default: bounded backoff on conflicts only)
//! - [`TxClient`] / [`InMemoryTxClient`] — the coordinator operation set
//!   as a client interface, with an embedded implementation
//! - [`discovery`] — endpoint selection strategies (reservoir sampling
//!   with a bounded wait)

pub mod client;
pub mod context;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod participant;

pub use client::{InMemoryTxClient, TxClient};
pub use context::TransactionContext;
pub use discovery::{
    Endpoint, EndpointStrategy, EndpointSupplier, RandomEndpointStrategy, RefreshableEndpoints,
    TimeLimitEndpointStrategy,
};
pub use error::{ParticipantError, ParticipantResult, TransactionFailure, TxPhase};
pub use executor::{RetryStrategies, RetryStrategy, TransactionExecutor};
pub use participant::TransactionParticipant;
