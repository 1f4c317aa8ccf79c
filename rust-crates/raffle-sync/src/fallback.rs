use crate::{
    Result,
    entity::RaffleEntity,
    error::IndexerError,
    feed::RaffleFeed,
};
use serde::Serialize;
use std::{
    fmt,
    time::Duration,
};
use tracing::{
    info,
    warn,
};

pub use crate::ledger::enumeration::LEDGER_ITEM_CAP;

/// How long the indexer gets before the ledger is asked instead.
pub const INDEXER_TIMEOUT: Duration = Duration::from_millis(4_500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Indexer,
    Ledger,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Indexer => f.write_str("indexer"),
            DataSource::Ledger => f.write_str("ledger"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loaded<T> {
    pub source: DataSource,
    pub items: T,
}

/// Runs `fut` under `timeout`; an elapsed timer drops (cancels) it.
pub async fn within_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| IndexerError::Timeout(timeout))?
}

/// Prefers the indexer, degrading to ledger enumeration when it is slow or
/// failing.
#[derive(Clone, Debug)]
pub struct IndexerThenLedger<I, L> {
    indexer: I,
    ledger: L,
    timeout: Duration,
}

impl<I: RaffleFeed, L: RaffleFeed> IndexerThenLedger<I, L> {
    pub fn new(indexer: I, ledger: L) -> Self {
        Self {
            indexer,
            ledger,
            timeout: INDEXER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn load(&self, limit: usize) -> Result<Loaded<Vec<RaffleEntity>>> {
        let indexer_err =
            match within_timeout(self.timeout, self.indexer.fetch_raffles(limit)).await {
                Ok(items) => {
                    return Ok(Loaded {
                        source: DataSource::Indexer,
                        items,
                    });
                }
                Err(err) => err,
            };
        warn!(%indexer_err, "indexer unavailable, enumerating ledger");

        let cap = limit.min(LEDGER_ITEM_CAP);
        match self.ledger.fetch_raffles(cap).await {
            Ok(mut items) => {
                items.truncate(cap);
                info!(count = items.len(), "loaded raffles from ledger");
                Ok(Loaded {
                    source: DataSource::Ledger,
                    items,
                })
            }
            Err(ledger_err) => {
                warn!(%indexer_err, %ledger_err, "both raffle sources failed");
                Err(ledger_err)
            }
        }
    }
}
