//! Per-user claimables: the raffles a user is attached to, with whatever they
//! can still claim, withdraw or refund.

use crate::{
    Error,
    Result,
    entity::{
        Address,
        ClaimableEntry,
        RaffleEntity,
        RaffleStatus,
        RoleTag,
    },
    enrichment::{
        EnrichmentPipeline,
        should_retain,
    },
    fallback::{
        DataSource,
        INDEXER_TIMEOUT,
        LEDGER_ITEM_CAP,
        within_timeout,
    },
    feed::UserRaffleSource,
    ledger::{
        EntityReadGateway,
        LedgerReader,
        enumeration::{
            LEDGER_READ_BATCH_SIZE,
            LedgerRaffleSource,
        },
    },
    merge::{
        TaggedRaffle,
        merge,
    },
};
use futures::future::join_all;
use std::{
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tracing::{
    debug,
    info,
    warn,
};

const LEDGER_MODE_NOTE: &str =
    "Indexer unavailable; showing balances read directly from the ledger";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewState {
    pub items: Vec<ClaimableEntry>,
    pub note: Option<String>,
    pub mode: DataSource,
    pub loading: bool,
    /// Whose claimables `items` are.
    pub user: Option<Address>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            note: None,
            mode: DataSource::Indexer,
            loading: false,
            user: None,
        }
    }
}

pub struct ClaimablesView<U, L> {
    indexer: U,
    ledger: Option<LedgerRaffleSource<L>>,
    pipeline: EnrichmentPipeline<L>,
    row_limit: usize,
    timeout: Duration,
    generation: AtomicU64,
    state: Mutex<ViewState>,
}

impl<U, L> ClaimablesView<U, L>
where
    U: UserRaffleSource,
    L: LedgerReader + Clone,
{
    pub fn new(indexer: U, gateway: EntityReadGateway<L>, row_limit: usize) -> Self {
        Self {
            indexer,
            ledger: None,
            pipeline: EnrichmentPipeline::new(gateway),
            row_limit,
            timeout: INDEXER_TIMEOUT,
            generation: AtomicU64::new(0),
            state: Mutex::new(ViewState::default()),
        }
    }

    /// Enables the ledger fallback, enumerating raffles from `factory`.
    pub fn with_ledger_enumeration(mut self, factory: Address) -> Self {
        self.ledger = Some(LedgerRaffleSource::new(
            self.pipeline.gateway().clone(),
            factory,
        ));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> ViewState {
        self.lock().clone()
    }

    /// Reloads the user's claimables. A newer call supersedes this one, in
    /// which case this returns [`Error::Cancelled`] and leaves state alone.
    /// Load failures keep the previous items and surface as a note.
    pub async fn refetch(&self, user: &Address) -> Result<ViewState> {
        if !user.is_valid() {
            return Err(Error::InvalidAddress(user.to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock().loading = true;
        let pending = PendingLoad {
            state: &self.state,
            generation: &self.generation,
            mine: generation,
            armed: true,
        };

        let outcome = self.load(user).await;
        pending.disarm();

        let mut state = self.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(%user, generation, "claimables refetch superseded");
            return Err(Error::Cancelled);
        }
        state.loading = false;
        match outcome {
            Ok(loaded) => {
                state.note = ledger_note(&loaded);
                state.mode = loaded.mode;
                state.items = loaded.items;
            }
            Err(err) => {
                warn!(%user, %err, "claimables refetch failed");
                if state.user.as_ref() != Some(user) {
                    state.items.clear();
                }
                state.note = Some(format!("Could not refresh claimables: {err}"));
            }
        }
        state.user = Some(user.clone());
        Ok(state.clone())
    }

    async fn load(&self, user: &Address) -> Result<LoadOutcome> {
        let indexer_err = match within_timeout(
            self.timeout,
            self.indexer.user_raffles(user, self.row_limit),
        )
        .await
        {
            Ok(sets) => {
                let merged = merge(sets.created, sets.participated);
                return Ok(LoadOutcome {
                    mode: DataSource::Indexer,
                    items: self.pipeline.enrich(merged, user).await,
                    unreadable: 0,
                });
            }
            Err(err) => err,
        };
        let Some(ledger) = &self.ledger else {
            return Err(indexer_err);
        };
        warn!(%user, %indexer_err, "indexer unavailable, reading claimables from ledger");

        let reads = ledger.read_raffles(LEDGER_ITEM_CAP).await?;
        let unreadable = reads.iter().filter(|(_, read)| read.is_err()).count();
        let (tagged, detail_errors): (Vec<TaggedRaffle>, Vec<Option<String>>) =
            tag_from_ledger(ledger, reads, user).await.into_iter().unzip();
        info!(%user, attached = tagged.len(), unreadable, "tagged raffles from ledger");

        let mut items = self.pipeline.enrich_all(tagged, user).await;
        for (entry, error) in items.iter_mut().zip(detail_errors) {
            if let Some(error) = error {
                entry.read_errors.insert(0, error);
            }
        }
        items.retain(should_retain);
        Ok(LoadOutcome {
            mode: DataSource::Ledger,
            items,
            unreadable,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<ViewState>) -> MutexGuard<'_, ViewState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LoadOutcome {
    mode: DataSource,
    items: Vec<ClaimableEntry>,
    /// Ledger raffles whose details could not be read.
    unreadable: usize,
}

fn ledger_note(loaded: &LoadOutcome) -> Option<String> {
    match (loaded.mode, loaded.unreadable) {
        (DataSource::Indexer, _) => None,
        (DataSource::Ledger, 0) => Some(LEDGER_MODE_NOTE.to_string()),
        (DataSource::Ledger, n) => {
            let plural = if n == 1 { "" } else { "s" };
            Some(format!(
                "{LEDGER_MODE_NOTE}; details unreadable for {n} raffle{plural}"
            ))
        }
    }
}

/// Clears `loading` if the refetch future is dropped before it finishes,
/// unless a newer refetch has taken over the flag.
struct PendingLoad<'a> {
    state: &'a Mutex<ViewState>,
    generation: &'a AtomicU64,
    mine: u64,
    armed: bool,
}

impl PendingLoad<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if self.armed && self.generation.load(Ordering::SeqCst) == self.mine {
            lock_state(self.state).loading = false;
        }
    }
}

/// Stand-in for a raffle whose details are unreadable. `Open` unlocks no
/// status-gated action.
fn unread_raffle(id: &Address) -> RaffleEntity {
    RaffleEntity {
        id: id.clone(),
        name: String::new(),
        status: RaffleStatus::Open,
        ticket_price: 0,
        prize_pool: 0,
        tickets_sold: 0,
        min_tickets: 0,
        max_tickets: None,
        deadline: 0,
        creator: Address::default(),
        completed_at: None,
        canceled_at: None,
        cancellation_reason: None,
        last_updated: 0,
    }
}

/// Works out the user's roles without the indexer. An unreadable ticket count
/// counts as participation, and so does an unreadable raffle, which comes back
/// with the read error attached.
async fn tag_from_ledger<L: LedgerReader>(
    ledger: &LedgerRaffleSource<L>,
    reads: Vec<(Address, Result<RaffleEntity>)>,
    user: &Address,
) -> Vec<(TaggedRaffle, Option<String>)> {
    let mut tagged = Vec::new();
    for batch in reads.chunks(LEDGER_READ_BATCH_SIZE) {
        let tags = batch.iter().map(|(id, read)| async move {
            let entity = match read {
                Ok(entity) => entity,
                Err(err) => {
                    warn!(raffle = %id, %err, "raffle unreadable, assuming participant");
                    let error = format!("raffle details: {err}");
                    return (unread_raffle(id), RoleTag::PARTICIPATED, Some(error));
                }
            };
            let participated = match ledger.participation(id, user).await {
                Ok(participated) => participated,
                Err(err) => {
                    warn!(
                        raffle = %id,
                        %err,
                        "participation unreadable, assuming participant"
                    );
                    true
                }
            };
            let mut roles = RoleTag::default();
            if entity.creator == *user {
                roles |= RoleTag::CREATED;
            }
            if participated {
                roles |= RoleTag::PARTICIPATED;
            }
            (entity.clone(), roles, None)
        });
        for (entity, roles, error) in join_all(tags).await {
            if roles.created || roles.participated {
                tagged.push((TaggedRaffle { entity, roles }, error));
            }
        }
    }
    tagged
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::AssetKind,
        error::IndexerError,
        feed::UserRaffles,
        test_helpers::{
            FakeLedger,
            address,
            raffle,
        },
    };
    use std::{
        collections::VecDeque,
        sync::Arc,
    };

    #[derive(Clone, Default)]
    struct FakeUserSource {
        outcomes: Arc<Mutex<VecDeque<(Duration, Result<UserRaffles>)>>>,
    }

    impl FakeUserSource {
        fn push(&self, delay: Duration, outcome: Result<UserRaffles>) {
            self.outcomes.lock().unwrap().push_back((delay, outcome));
        }
    }

    impl UserRaffleSource for FakeUserSource {
        async fn user_raffles(&self, _user: &Address, _limit: usize) -> Result<UserRaffles> {
            let next = self.outcomes.lock().unwrap().pop_front();
            let Some((delay, outcome)) = next else {
                return Ok(UserRaffles::default());
            };
            tokio::time::sleep(delay).await;
            outcome
        }
    }

    fn user() -> Address {
        address(0xbeef)
    }

    fn indexer_down() -> Result<UserRaffles> {
        Err(Error::Indexer(IndexerError::Http {
            status: 502,
            body: "bad gateway".to_string(),
        }))
    }

    fn view(
        source: &FakeUserSource,
        ledger: &FakeLedger,
    ) -> ClaimablesView<FakeUserSource, FakeLedger> {
        ClaimablesView::new(source.clone(), EntityReadGateway::new(ledger.clone()), 100)
    }

    #[tokio::test]
    async fn refetch__indexer_path__merges_enriches_and_filters() {
        // given
        let source = FakeUserSource::default();
        let ledger = FakeLedger::new();
        let mut mine = raffle(1, RaffleStatus::Completed, 30);
        mine.creator = user();
        let won = raffle(2, RaffleStatus::Completed, 20);
        let lost = raffle(3, RaffleStatus::Completed, 10);
        for (entity, usdc) in [(&mine, 900), (&won, 100), (&lost, 0)] {
            ledger.reply_uint(&entity.id, "claimableFunds", usdc);
            ledger.reply_uint(&entity.id, "claimableNative", 0);
        }
        source.push(
            Duration::ZERO,
            Ok(UserRaffles {
                created: vec![mine.clone()],
                participated: vec![won.clone(), lost, mine],
            }),
        );

        // when
        let state = view(&source, &ledger).refetch(&user()).await.unwrap();

        // then
        assert_eq!(state.mode, DataSource::Indexer);
        assert_eq!(state.note, None);
        assert!(!state.loading);
        let ids: Vec<Address> = state.items.iter().map(|e| e.entity.id.clone()).collect();
        assert_eq!(ids, vec![address(1), address(2)]);
        assert!(state.items[0].is_creator);
        assert!(state.items[0].roles.created && state.items[0].roles.participated);
        assert_eq!(state.items[1].amount(AssetKind::Usdc), 100);
    }

    #[tokio::test]
    async fn refetch__indexer_down__reads_roles_from_ledger() {
        // given
        let source = FakeUserSource::default();
        source.push(Duration::ZERO, indexer_down());
        let ledger = FakeLedger::new();
        let factory = address(0xfac);
        let mut created = raffle(1, RaffleStatus::Completed, 0);
        created.creator = user();
        let bought = raffle(2, RaffleStatus::Completed, 0);
        let unknown = raffle(3, RaffleStatus::Canceled, 0);
        let stranger = raffle(4, RaffleStatus::Completed, 0);
        ledger.stub_factory(
            &factory,
            &[
                created.id.clone(),
                bought.id.clone(),
                unknown.id.clone(),
                stranger.id.clone(),
            ],
        );
        for entity in [&created, &bought, &unknown, &stranger] {
            ledger.stub_raffle(entity);
            ledger.reply_uint(&entity.id, "claimableFunds", 0);
            ledger.reply_uint(&entity.id, "claimableNative", 0);
        }
        ledger.reply_uint(&created.id, "claimableFunds", 500);
        ledger.reply_uint(&created.id, "ticketsOf", 0);
        ledger.reply_uint(&bought.id, "ticketsOf", 3);
        ledger.reply_uint(&bought.id, "claimableFunds", 75);
        ledger.fail(&unknown.id, "ticketsOf", "execution reverted");
        ledger.reply_uint(&stranger.id, "ticketsOf", 0);
        let view = view(&source, &ledger).with_ledger_enumeration(factory);

        // when
        let state = view.refetch(&user()).await.unwrap();

        // then
        assert_eq!(state.mode, DataSource::Ledger);
        assert_eq!(state.note.as_deref(), Some(LEDGER_MODE_NOTE));
        let ids: Vec<Address> = state.items.iter().map(|e| e.entity.id.clone()).collect();
        // newest first; stranger never gets enriched
        assert_eq!(ids, vec![unknown.id.clone(), bought.id.clone(), created.id.clone()]);
        assert!(state.items[0].roles.participated);
        assert_eq!(ledger.calls_to("claimableFunds"), 3);
    }

    #[tokio::test]
    async fn refetch__indexer_down_without_ledger__keeps_items_and_notes() {
        // given
        let source = FakeUserSource::default();
        let ledger = FakeLedger::new();
        let won = raffle(2, RaffleStatus::Completed, 20);
        ledger.reply_uint(&won.id, "claimableFunds", 100);
        ledger.reply_uint(&won.id, "claimableNative", 0);
        source.push(
            Duration::ZERO,
            Ok(UserRaffles {
                created: vec![],
                participated: vec![won],
            }),
        );
        source.push(Duration::ZERO, indexer_down());
        let view = view(&source, &ledger);
        view.refetch(&user()).await.unwrap();

        // when
        let state = view.refetch(&user()).await.unwrap();

        // then
        assert_eq!(state.items.len(), 1);
        let note = state.note.expect("note");
        assert!(note.contains("SUBGRAPH_HTTP_ERROR_502"), "{note}");
    }

    #[tokio::test]
    async fn refetch__invalid_user__is_rejected_before_any_io() {
        // given
        let source = FakeUserSource::default();
        let ledger = FakeLedger::new();

        // when
        let err = view(&source, &ledger)
            .refetch(&Address::new("me"))
            .await
            .unwrap_err();

        // then
        assert!(matches!(err, Error::InvalidAddress(_)));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refetch__newer_call__supersedes_older_one() {
        // given
        let source = FakeUserSource::default();
        let ledger = FakeLedger::new();
        let slow = raffle(1, RaffleStatus::Canceled, 0);
        let fast = raffle(2, RaffleStatus::Canceled, 0);
        for entity in [&slow, &fast] {
            ledger.reply_uint(&entity.id, "claimableFunds", 0);
            ledger.reply_uint(&entity.id, "claimableNative", 0);
        }
        source.push(
            Duration::from_secs(3),
            Ok(UserRaffles {
                created: vec![],
                participated: vec![slow],
            }),
        );
        source.push(
            Duration::from_secs(1),
            Ok(UserRaffles {
                created: vec![],
                participated: vec![fast.clone()],
            }),
        );
        let view = view(&source, &ledger);

        // when
        let user = user();
        let (older, newer) = futures::join!(view.refetch(&user), view.refetch(&user));

        // then
        assert!(matches!(older, Err(Error::Cancelled)));
        let newer = newer.unwrap();
        assert_eq!(newer.items.len(), 1);
        assert_eq!(newer.items[0].entity.id, fast.id);
        assert_eq!(view.state(), newer);
    }

    #[tokio::test]
    async fn refetch__ledger_raffle_unreadable__surfaces_it_with_its_balance() {
        // given
        let source = FakeUserSource::default();
        source.push(Duration::ZERO, indexer_down());
        let ledger = FakeLedger::new();
        let factory = address(0xfac);
        let broken = raffle(1, RaffleStatus::Completed, 0);
        ledger.stub_factory(&factory, &[broken.id.clone()]);
        ledger.stub_raffle(&broken);
        ledger.fail(&broken.id, "status", "execution reverted");
        ledger.reply_uint(&broken.id, "ticketsOf", 3);
        ledger.reply_uint(&broken.id, "claimableFunds", 500);
        ledger.reply_uint(&broken.id, "claimableNative", 0);
        let view = view(&source, &ledger).with_ledger_enumeration(factory);

        // when
        let state = view.refetch(&user()).await.unwrap();

        // then
        assert_eq!(state.items.len(), 1);
        let entry = &state.items[0];
        assert_eq!(entry.entity.id, broken.id);
        assert!(entry.roles.participated);
        assert_eq!(entry.amount(AssetKind::Usdc), 500);
        assert!(
            entry.read_errors[0].starts_with("raffle details:"),
            "{:?}",
            entry.read_errors
        );
        assert_eq!(ledger.calls_to("claimableFunds"), 1);
        let note = state.note.expect("note");
        assert!(note.ends_with("details unreadable for 1 raffle"), "{note}");
    }

    #[tokio::test]
    async fn refetch__ledger_raffle_unreadable_with_nothing_owed__is_still_listed() {
        // given
        let source = FakeUserSource::default();
        source.push(Duration::ZERO, indexer_down());
        let ledger = FakeLedger::new();
        let factory = address(0xfac);
        let broken = raffle(1, RaffleStatus::Open, 0);
        ledger.stub_factory(&factory, &[broken.id.clone()]);
        ledger.fail(&broken.id, "creator", "execution reverted");
        ledger.reply_uint(&broken.id, "claimableFunds", 0);
        ledger.reply_uint(&broken.id, "claimableNative", 0);
        let view = view(&source, &ledger).with_ledger_enumeration(factory);

        // when
        let state = view.refetch(&user()).await.unwrap();

        // then
        assert_eq!(state.items.len(), 1);
        assert!(!state.items[0].has_positive_amount());
        assert_eq!(state.items[0].read_errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refetch__dropped_while_waiting__clears_loading() {
        // given
        let source = FakeUserSource::default();
        let ledger = FakeLedger::new();
        source.push(Duration::from_secs(3), Ok(UserRaffles::default()));
        let view = view(&source, &ledger);
        let user = user();

        // when
        let abandoned = tokio::time::timeout(Duration::from_secs(1), view.refetch(&user)).await;

        // then
        assert!(abandoned.is_err());
        assert!(!view.state().loading);
    }
}
