use crate::{
    entity::{
        Address,
        AssetKind,
        ClaimableEntry,
        RaffleStatus,
    },
    ledger::{
        AbiArg,
        EntityReadGateway,
        LedgerReader,
    },
    merge::TaggedRaffle,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{
    debug,
    warn,
};

/// Raffles enriched concurrently; the next batch waits for this one.
pub const ENRICH_BATCH_SIZE: usize = 10;

/// `(primary, fallback)` read methods for the user's claimable balance.
fn claim_methods(asset: AssetKind) -> (&'static str, &'static str) {
    match asset {
        AssetKind::Usdc => ("claimableFunds", "getClaimableFunds"),
        AssetKind::Native => ("claimableNative", "getClaimableNative"),
    }
}

/// Keep anything the user might still act on, and anything we failed to read.
pub fn should_retain(entry: &ClaimableEntry) -> bool {
    !entry.read_errors.is_empty()
        || entry.has_positive_amount()
        || (entry.roles.participated && entry.entity.status == RaffleStatus::Canceled)
}

#[derive(Clone, Debug)]
pub struct EnrichmentPipeline<L> {
    gateway: EntityReadGateway<L>,
    batch_size: usize,
}

impl<L: LedgerReader> EnrichmentPipeline<L> {
    pub fn new(gateway: EntityReadGateway<L>) -> Self {
        Self {
            gateway,
            batch_size: ENRICH_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn gateway(&self) -> &EntityReadGateway<L> {
        &self.gateway
    }

    /// Attaches the user's claimable balances to each raffle and drops the
    /// ones with nothing left to do. Input order is preserved.
    pub async fn enrich(
        &self,
        entries: Vec<TaggedRaffle>,
        user: &Address,
    ) -> Vec<ClaimableEntry> {
        let total = entries.len();
        let mut enriched = self.enrich_all(entries, user).await;
        enriched.retain(should_retain);
        debug!(%user, total, retained = enriched.len(), "enriched raffles");
        enriched
    }

    /// [`enrich`](Self::enrich) without the retention filter: one entry per
    /// input, in input order.
    pub async fn enrich_all(
        &self,
        entries: Vec<TaggedRaffle>,
        user: &Address,
    ) -> Vec<ClaimableEntry> {
        let mut enriched = Vec::with_capacity(entries.len());
        for batch in entries.chunks(self.batch_size) {
            let reads = batch.iter().map(|tagged| self.enrich_one(tagged, user));
            enriched.extend(join_all(reads).await);
        }
        enriched
    }

    async fn enrich_one(&self, tagged: &TaggedRaffle, user: &Address) -> ClaimableEntry {
        let mut entry = ClaimableEntry {
            entity: tagged.entity.clone(),
            roles: tagged.roles,
            claimable: AssetKind::ALL
                .iter()
                .map(|asset| (*asset, "0".to_string()))
                .collect::<BTreeMap<_, _>>(),
            is_creator: tagged.entity.creator == *user,
            read_errors: Vec::new(),
        };
        let id = &tagged.entity.id;
        if !id.is_valid() {
            entry
                .read_errors
                .push(format!("invalid raffle address `{id}`"));
            return entry;
        }

        let (usdc, native) = futures::join!(
            self.read_amount(id, user, AssetKind::Usdc),
            self.read_amount(id, user, AssetKind::Native),
        );
        for (asset, read) in [(AssetKind::Usdc, usdc), (AssetKind::Native, native)] {
            match read {
                Ok(amount) => {
                    entry.claimable.insert(asset, amount.to_string());
                }
                Err(err) => {
                    warn!(raffle = %id, %asset, %err, "claimable read failed");
                    entry.read_errors.push(format!("{asset}: {err}"));
                }
            }
        }
        entry
    }

    async fn read_amount(
        &self,
        id: &Address,
        user: &Address,
        asset: AssetKind,
    ) -> crate::Result<u128> {
        let (method, fallback) = claim_methods(asset);
        self.gateway
            .read(id, method, &[AbiArg::Address(user.clone())], Some(fallback))
            .await
    }
}
