//! Shared fixtures and fake seams for unit tests.

use crate::{
    Result,
    entity::{
        Address,
        RaffleEntity,
        RaffleStatus,
    },
    feed::RaffleFeed,
    ledger::{
        LedgerReader,
        MethodCall,
        abi::WORD,
    },
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};

/// Deterministic, valid address derived from `n`.
pub fn address(n: u64) -> Address {
    Address::new(format!("0x{n:040x}"))
}

pub fn raffle(n: u64, status: RaffleStatus, last_updated: i64) -> RaffleEntity {
    RaffleEntity {
        id: address(n),
        name: format!("Raffle #{n}"),
        status,
        ticket_price: 1_000_000,
        prize_pool: 0,
        tickets_sold: 0,
        min_tickets: 0,
        max_tickets: None,
        deadline: 0,
        creator: address(0xc0ffee),
        completed_at: None,
        canceled_at: None,
        cancellation_reason: None,
        last_updated,
    }
}

pub fn uint_word(value: u128) -> Vec<u8> {
    let mut word = vec![0u8; WORD];
    word[WORD - 16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn address_word(address: &Address) -> Vec<u8> {
    let body = address.as_str().trim_start_matches("0x");
    let mut word = vec![0u8; WORD - body.len() / 2];
    word.extend(hex::decode(body).unwrap());
    word
}

pub fn address_array(addresses: &[Address]) -> Vec<u8> {
    let mut data = uint_word(WORD as u128);
    data.extend(uint_word(addresses.len() as u128));
    for address in addresses {
        data.extend(address_word(address));
    }
    data
}

pub fn string_data(text: &str) -> Vec<u8> {
    let mut data = uint_word(WORD as u128);
    data.extend(uint_word(text.len() as u128));
    let mut body = text.as_bytes().to_vec();
    body.resize(body.len().div_ceil(WORD).max(1) * WORD, 0);
    data.extend(body);
    data
}

fn status_code(status: RaffleStatus) -> u128 {
    match status {
        RaffleStatus::FundingPending => 0,
        RaffleStatus::Open => 1,
        RaffleStatus::Drawing => 2,
        RaffleStatus::Completed => 3,
        RaffleStatus::Canceled => 4,
    }
}

/// Feed that replays queued outcomes, then keeps returning `fallback_items`.
#[derive(Clone, Default)]
pub struct FakeFeed {
    outcomes: Arc<Mutex<VecDeque<Result<Vec<RaffleEntity>>>>>,
    fallback_items: Arc<Vec<RaffleEntity>>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl FakeFeed {
    pub fn new(items: Vec<RaffleEntity>) -> Self {
        Self {
            fallback_items: Arc::new(items),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_outcome(&self, outcome: Result<Vec<RaffleEntity>>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RaffleFeed for FakeFeed {
    async fn fetch_raffles(&self, limit: usize) -> Result<Vec<RaffleEntity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.outcomes.lock().unwrap().pop_front();
        match queued {
            Some(outcome) => outcome,
            None => Ok(self.fallback_items.iter().take(limit).cloned().collect()),
        }
    }
}

type Reply = std::result::Result<Vec<u8>, String>;

/// Ledger answering `(contract, method name)` pairs from a table; anything
/// else reverts.
#[derive(Clone, Default)]
pub struct FakeLedger {
    replies: Arc<Mutex<HashMap<(Address, String), Reply>>>,
    calls: Arc<Mutex<Vec<(Address, String)>>>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, to: &Address, method: &str, data: Vec<u8>) {
        self.replies
            .lock()
            .unwrap()
            .insert((to.clone(), method.to_string()), Ok(data));
    }

    pub fn reply_uint(&self, to: &Address, method: &str, value: u128) {
        self.reply(to, method, uint_word(value));
    }

    pub fn fail(&self, to: &Address, method: &str, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert((to.clone(), method.to_string()), Err(message.to_string()));
    }

    pub fn stub_factory(&self, factory: &Address, raffles: &[Address]) {
        self.reply(factory, "getAllRaffles", address_array(raffles));
    }

    /// Answers every field getter of `entity` the way a deployed raffle would.
    pub fn stub_raffle(&self, entity: &RaffleEntity) {
        let id = &entity.id;
        self.reply(id, "name", string_data(&entity.name));
        self.reply_uint(id, "status", status_code(entity.status));
        self.reply(id, "creator", address_word(&entity.creator));
        self.reply_uint(id, "ticketPrice", entity.ticket_price);
        self.reply_uint(id, "prizePool", entity.prize_pool);
        self.reply_uint(id, "ticketsSold", entity.tickets_sold.into());
        self.reply_uint(id, "minTickets", entity.min_tickets.into());
        self.reply_uint(id, "maxTickets", entity.max_tickets.unwrap_or(0).into());
        self.reply_uint(id, "deadline", entity.deadline as u128);
        self.reply_uint(id, "completedAt", entity.completed_at.unwrap_or(0) as u128);
        self.reply_uint(id, "canceledAt", entity.canceled_at.unwrap_or(0) as u128);
        self.reply(
            id,
            "cancellationReason",
            string_data(entity.cancellation_reason.as_deref().unwrap_or_default()),
        );
    }

    pub fn calls(&self) -> Vec<(Address, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m == method)
            .count()
    }
}

impl LedgerReader for FakeLedger {
    async fn call(&self, to: &Address, call: &MethodCall) -> Result<Vec<u8>> {
        let key = (to.clone(), call.name().to_string());
        self.calls.lock().unwrap().push(key.clone());
        let reply = self.replies.lock().unwrap().get(&key).cloned();
        match reply {
            Some(Ok(data)) => Ok(data),
            Some(Err(message)) => Err(crate::error::LedgerError::Rpc {
                code: 3,
                message,
            }
            .into()),
            None => Err(crate::error::LedgerError::Rpc {
                code: 3,
                message: "execution reverted".to_string(),
            }
            .into()),
        }
    }
}
