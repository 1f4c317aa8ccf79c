//! Client-side synchronization core for the raffle dashboard.
//!
//! Raffle data comes from two places: a fast but eventually consistent indexer
//! (a GraphQL subgraph) and the authoritative ledger, which is only queried per
//! raffle. This crate keeps a shared, rate-limited view of all raffles fresh
//! ([`polling_store`]), and turns indexer-reported roles plus per-user ledger
//! reads into the list of raffles a user can still act on ([`merge`],
//! [`enrichment`], [`dashboard`]).

pub mod config;
pub mod dashboard;
pub mod enrichment;
pub mod entity;
pub mod error;
pub mod fallback;
pub mod feed;
pub mod indexer_client;
pub mod ledger;
pub mod merge;
pub mod polling_store;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::SyncConfig;
pub use error::{
    Error,
    FailureKind,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
