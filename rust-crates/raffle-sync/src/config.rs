use crate::{
    Result,
    entity::Address,
    error::ConfigError,
};
use url::Url;

pub const INDEXER_URL_VAR: &str = "RAFFLE_SUBGRAPH_URL";
pub const LEDGER_RPC_URL_VAR: &str = "RAFFLE_LEDGER_RPC_URL";
pub const FACTORY_ADDRESS_VAR: &str = "RAFFLE_FACTORY_ADDRESS";
pub const ROW_LIMIT_VAR: &str = "RAFFLE_ROW_LIMIT";

pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Raw endpoint settings. Values are validated when they are first used, so a
/// missing indexer URL only fails the code path that needs it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncConfig {
    indexer_url: Option<String>,
    ledger_rpc_url: Option<String>,
    factory_address: Option<String>,
    row_limit: Option<String>,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |var: &str| {
            lookup(var)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        Self {
            indexer_url: non_empty(INDEXER_URL_VAR),
            ledger_rpc_url: non_empty(LEDGER_RPC_URL_VAR),
            factory_address: non_empty(FACTORY_ADDRESS_VAR),
            row_limit: non_empty(ROW_LIMIT_VAR),
        }
    }

    pub fn with_indexer_url(mut self, url: impl Into<String>) -> Self {
        self.indexer_url = Some(url.into());
        self
    }

    pub fn with_ledger_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.ledger_rpc_url = Some(url.into());
        self
    }

    pub fn with_factory_address(mut self, address: impl Into<String>) -> Self {
        self.factory_address = Some(address.into());
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit.to_string());
        self
    }

    /// The indexer endpoint. There is no default: a missing value is a fatal
    /// configuration error.
    pub fn indexer_url(&self) -> Result<Url> {
        let raw = self.indexer_url.as_deref().ok_or(ConfigError::Missing {
            var: INDEXER_URL_VAR,
        })?;
        parse_url(INDEXER_URL_VAR, raw)
    }

    pub fn ledger_rpc_url(&self) -> Result<Option<Url>> {
        self.ledger_rpc_url
            .as_deref()
            .map(|raw| parse_url(LEDGER_RPC_URL_VAR, raw))
            .transpose()
    }

    pub fn factory_address(&self) -> Result<Option<Address>> {
        let Some(raw) = self.factory_address.as_deref() else {
            return Ok(None);
        };
        let address = Address::new(raw);
        if !address.is_valid() {
            return Err(ConfigError::Invalid {
                var: FACTORY_ADDRESS_VAR,
                reason: format!("`{raw}` is not a ledger address"),
            }
            .into());
        }
        Ok(Some(address))
    }

    pub fn row_limit(&self) -> Result<usize> {
        let Some(raw) = self.row_limit.as_deref() else {
            return Ok(DEFAULT_ROW_LIMIT);
        };
        match raw.parse::<usize>() {
            Ok(limit) if limit > 0 => Ok(limit),
            _ => Err(ConfigError::Invalid {
                var: ROW_LIMIT_VAR,
                reason: format!("expected a positive integer, got `{raw}`"),
            }
            .into()),
        }
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| {
        ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }
        .into()
    })
}
