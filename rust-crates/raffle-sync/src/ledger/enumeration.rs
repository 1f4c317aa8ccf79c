//! Reading raffles straight off the ledger when the indexer can't be used.

use crate::{
    Error,
    Result,
    entity::{
        Address,
        RaffleEntity,
        RaffleStatus,
    },
    error::LedgerError,
    feed::RaffleFeed,
    ledger::{
        AbiArg,
        EntityReadGateway,
        FromReturnData,
        LedgerReader,
    },
};
use futures::future::join_all;
use tracing::{
    debug,
    warn,
};

/// Upper bound on raffles enumerated per load.
pub const LEDGER_ITEM_CAP: usize = 200;
pub const LEDGER_READ_BATCH_SIZE: usize = 10;

#[derive(Clone, Debug)]
pub struct LedgerRaffleSource<L> {
    gateway: EntityReadGateway<L>,
    factory: Address,
}

impl<L: LedgerReader> LedgerRaffleSource<L> {
    pub fn new(gateway: EntityReadGateway<L>, factory: Address) -> Self {
        Self { gateway, factory }
    }

    pub fn factory(&self) -> &Address {
        &self.factory
    }

    /// Every raffle the factory has deployed, oldest first.
    pub async fn raffle_addresses(&self) -> Result<Vec<Address>> {
        self.gateway
            .read(&self.factory, "getAllRaffles", &[], Some("getRaffles"))
            .await
    }

    pub async fn read_raffle(&self, id: &Address) -> Result<RaffleEntity> {
        let (status, creator) = futures::join!(
            self.gateway.read::<u8>(id, "status", &[], None),
            self.gateway.read::<Address>(id, "creator", &[], None),
        );
        let code = status?;
        let status = RaffleStatus::from_ledger_code(code).ok_or_else(|| {
            Error::from(LedgerError::Decode(format!("unknown status code {code}")))
        })?;
        let creator = creator?;

        let (
            name,
            ticket_price,
            prize_pool,
            tickets_sold,
            min_tickets,
            max_tickets,
            deadline,
            completed_at,
            canceled_at,
            cancellation_reason,
        ) = futures::join!(
            self.optional::<String>(id, "name"),
            self.optional::<u128>(id, "ticketPrice"),
            self.optional::<u128>(id, "prizePool"),
            self.optional::<u64>(id, "ticketsSold"),
            self.optional::<u64>(id, "minTickets"),
            self.optional::<u64>(id, "maxTickets"),
            self.optional::<i64>(id, "deadline"),
            self.optional::<i64>(id, "completedAt"),
            self.optional::<i64>(id, "canceledAt"),
            self.optional::<String>(id, "cancellationReason"),
        );

        let deadline = deadline.unwrap_or_default();
        let completed_at = completed_at.filter(|ts| *ts > 0);
        let canceled_at = canceled_at.filter(|ts| *ts > 0);
        let last_updated = completed_at.or(canceled_at).unwrap_or(deadline);
        Ok(RaffleEntity {
            id: id.clone(),
            name: name.unwrap_or_default(),
            status,
            ticket_price: ticket_price.unwrap_or_default(),
            prize_pool: prize_pool.unwrap_or_default(),
            tickets_sold: tickets_sold.unwrap_or_default(),
            min_tickets: min_tickets.unwrap_or_default(),
            max_tickets: max_tickets.filter(|max| *max > 0),
            deadline,
            creator,
            completed_at,
            canceled_at,
            cancellation_reason: cancellation_reason.filter(|reason| !reason.is_empty()),
            last_updated,
        })
    }

    /// The newest `min(limit, 200)` raffles, newest first, each paired with
    /// its own read outcome.
    pub async fn read_raffles(
        &self,
        limit: usize,
    ) -> Result<Vec<(Address, Result<RaffleEntity>)>> {
        let addresses = self.raffle_addresses().await?;
        let take = limit.min(LEDGER_ITEM_CAP);
        // Factories append, so the tail is the newest.
        let newest: Vec<Address> = addresses.into_iter().rev().take(take).collect();
        debug!(
            factory = %self.factory,
            count = newest.len(),
            "enumerating raffles from ledger"
        );

        let mut reads = Vec::with_capacity(newest.len());
        for batch in newest.chunks(LEDGER_READ_BATCH_SIZE) {
            let batch_reads = batch
                .iter()
                .map(|id| async move { (id.clone(), self.read_raffle(id).await) });
            reads.extend(join_all(batch_reads).await);
        }
        Ok(reads)
    }

    /// Whether `user` holds any tickets in the raffle.
    pub async fn participation(&self, id: &Address, user: &Address) -> Result<bool> {
        let tickets: u64 = self
            .gateway
            .read(
                id,
                "ticketsOf",
                &[AbiArg::Address(user.clone())],
                Some("getUserTicketCount"),
            )
            .await?;
        Ok(tickets > 0)
    }

    async fn optional<T: FromReturnData>(&self, id: &Address, field: &str) -> Option<T> {
        match self.gateway.read(id, field, &[], None).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(raffle = %id, field, %err, "ledger field unreadable, using default");
                None
            }
        }
    }
}

impl<L: LedgerReader> RaffleFeed for LedgerRaffleSource<L> {
    async fn fetch_raffles(&self, limit: usize) -> Result<Vec<RaffleEntity>> {
        let reads = self.read_raffles(limit).await?;
        Ok(reads
            .into_iter()
            .filter_map(|(id, read)| match read {
                Ok(raffle) => Some(raffle),
                Err(err) => {
                    warn!(raffle = %id, %err, "skipping unreadable raffle");
                    None
                }
            })
            .collect())
    }
}
