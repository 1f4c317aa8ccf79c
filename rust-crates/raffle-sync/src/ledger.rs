use crate::{
    Error,
    Result,
    entity::Address,
    error::LedgerError,
};
use std::sync::Arc;
use tracing::debug;

pub mod abi;
pub mod enumeration;
pub mod json_rpc;

pub use abi::{
    AbiArg,
    FromReturnData,
    MethodCall,
};

/// Raw read access to contracts on the ledger.
pub trait LedgerReader: Send + Sync {
    /// Executes a read-only call against `to` and returns the raw return data.
    fn call(
        &self,
        to: &Address,
        call: &MethodCall,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

impl<L: LedgerReader> LedgerReader for Arc<L> {
    fn call(
        &self,
        to: &Address,
        call: &MethodCall,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send {
        (**self).call(to, call)
    }
}

/// Typed single-value reads by logical method name, tolerant of ABI drift
/// between contract versions through an optional fallback method.
#[derive(Clone, Debug)]
pub struct EntityReadGateway<L> {
    reader: L,
}

impl<L: LedgerReader> EntityReadGateway<L> {
    pub fn new(reader: L) -> Self {
        Self { reader }
    }

    /// Tries `method`, then `fallback` if given. When both fail the error
    /// carries both messages.
    pub async fn read<T: FromReturnData>(
        &self,
        entity: &Address,
        method: &str,
        args: &[AbiArg],
        fallback: Option<&str>,
    ) -> Result<T> {
        if !entity.is_valid() {
            return Err(Error::InvalidAddress(entity.to_string()));
        }
        let primary_err = match self.read_once(entity, method, args).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(fallback) = fallback else {
            return Err(primary_err);
        };
        debug!(
            %entity,
            method,
            fallback,
            error = %primary_err,
            "primary read failed; trying fallback"
        );
        match self.read_once(entity, fallback, args).await {
            Ok(value) => Ok(value),
            Err(fallback_err) => Err(LedgerError::FallbackExhausted {
                primary: format!("{method}: {primary_err}"),
                fallback: format!("{fallback}: {fallback_err}"),
            }
            .into()),
        }
    }

    async fn read_once<T: FromReturnData>(
        &self,
        entity: &Address,
        method: &str,
        args: &[AbiArg],
    ) -> Result<T> {
        let call = MethodCall::new(method, args.to_vec());
        let data = self.reader.call(entity, &call).await?;
        T::from_return_data(method, &data)
    }
}
