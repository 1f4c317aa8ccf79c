//! Shared, reference-counted poller for the full raffle list.
//!
//! One [`PollingStore`] is built at startup and handed to every consumer.
//! Consumers subscribe with the interval they would like; the store runs a
//! single fetch loop at the tightest requested pace (clamped, and slowed down
//! while the app is hidden), de-duplicates overlapping fetches, and backs off
//! when the indexer misbehaves.

use crate::{
    Error,
    entity::RaffleEntity,
    error::FailureKind,
    feed::RaffleFeed,
};
use chrono::{
    DateTime,
    Utc,
};
use futures::{
    FutureExt,
    future::{
        BoxFuture,
        Shared,
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
        MutexGuard,
        PoisonError,
        Weak,
    },
    time::Duration,
};
use tokio::{
    task::{
        AbortHandle,
        JoinHandle,
    },
    time::Instant,
};
use tracing::{
    debug,
    info,
    warn,
};

mod backoff;

pub use backoff::{
    BackoffPolicy,
    BackoffState,
};

pub const MIN_FOREGROUND_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_BACKGROUND_INTERVAL: Duration = Duration::from_secs(60);
/// Used when nobody has asked for a specific pace.
pub const DEFAULT_REQUESTED_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// `None` until the first successful fetch.
    pub items: Option<Arc<Vec<RaffleEntity>>>,
    pub is_loading: bool,
    /// Advisory text while the indexer is failing.
    pub note: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

type Listener = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

/// Releases a subscription or listener when dropped.
#[must_use = "dropping a Subscription releases it immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

struct Subscriber {
    key: String,
    interval: Duration,
}

struct InFlight {
    done: Shared<BoxFuture<'static, ()>>,
    task: AbortHandle,
}

struct Timer {
    id: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    snapshot: StoreSnapshot,
    backoff: BackoffState,
    visibility: Visibility,
    subscribers: HashMap<u64, Subscriber>,
    listeners: HashMap<u64, Listener>,
    next_token: u64,
    /// Bumped on teardown; fetches started under an older epoch are ignored.
    epoch: u64,
    in_flight: Option<InFlight>,
    timer: Option<Timer>,
    /// Snapshots waiting for delivery, in mutation order.
    undelivered: VecDeque<StoreSnapshot>,
    /// Set while some thread is handing snapshots to listeners.
    dispatching: bool,
}

impl State {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn is_active(&self) -> bool {
        !self.subscribers.is_empty()
    }

    fn effective_interval(&self) -> Duration {
        let requested = self
            .subscribers
            .values()
            .map(|s| s.interval)
            .min()
            .unwrap_or(DEFAULT_REQUESTED_INTERVAL);
        let foreground = requested.max(MIN_FOREGROUND_INTERVAL);
        match self.visibility {
            Visibility::Visible => foreground,
            Visibility::Hidden => foreground.max(MIN_BACKGROUND_INTERVAL),
        }
    }

    fn next_delay(&self, now: Instant) -> Duration {
        self.backoff
            .remaining(now)
            .unwrap_or_else(|| self.effective_interval())
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

struct Inner<F> {
    feed: F,
    row_limit: usize,
    state: Mutex<State>,
}

pub struct PollingStore<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for PollingStore<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: RaffleFeed + 'static> PollingStore<F> {
    pub fn new(feed: F, row_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed,
                row_limit,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Registers interest at the given pace. The first subscriber starts the
    /// loop with an immediate fetch; the last one to leave stops it.
    pub fn subscribe(&self, key: impl Into<String>, interval: Duration) -> Subscription {
        let key = key.into();
        let mut state = self.lock();
        let token = state.token();
        let first = !state.is_active();
        debug!(%key, ?interval, first, "subscriber joined");
        state.subscribers.insert(token, Subscriber { key, interval });
        let has_items = state.snapshot.items.is_some();
        if first {
            info!("polling store activated");
            self.start_refresh(state, false, true);
        } else if !has_items {
            self.start_refresh(state, false, false);
        } else {
            if state.in_flight.is_none() {
                self.arm_timer(&mut state, true);
            }
            drop(state);
        }

        let store = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = store.upgrade() {
                PollingStore { inner }.unsubscribe(token);
            }
        })
    }

    /// `listener` runs synchronously after every state change, outside the
    /// store's lock.
    pub fn on_change(
        &self,
        listener: impl Fn(&StoreSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let mut state = self.lock();
        let token = state.token();
        state.listeners.insert(token, Arc::new(listener));
        drop(state);

        let store = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = store.upgrade() {
                PollingStore { inner }.lock().listeners.remove(&token);
            }
        })
    }

    /// Fetches unless a fetch is already running, in which case this waits
    /// for that one. Without `force`, a pending backoff window only
    /// reschedules.
    pub async fn refresh(&self, background: bool, force: bool) {
        let state = self.lock();
        if let Some(done) = self.start_refresh(state, background, force) {
            done.await;
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        let mut state = self.lock();
        if state.visibility == visibility {
            return;
        }
        debug!(?visibility, "visibility changed");
        state.visibility = visibility;
        if !state.is_active() {
            return;
        }
        match visibility {
            Visibility::Visible => {
                self.start_refresh(state, false, false);
            }
            Visibility::Hidden => {
                if state.in_flight.is_none() {
                    self.arm_timer(&mut state, false);
                }
            }
        }
    }

    /// Catch-up fetch when the app regains focus; respects backoff.
    pub fn notify_focus(&self) {
        let state = self.lock();
        if state.is_active() {
            self.start_refresh(state, false, false);
        }
    }

    pub fn effective_interval(&self) -> Duration {
        self.lock().effective_interval()
    }

    pub fn backoff_state(&self) -> BackoffState {
        self.lock().backoff
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn subscriber_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .subscribers
            .values()
            .map(|s| s.key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the current snapshot for listeners. Whichever thread finds
    /// nobody dispatching drains the queue, calling listeners with the lock
    /// released, so listeners see snapshots one at a time and in order.
    fn publish<'a>(&'a self, mut state: MutexGuard<'a, State>) {
        let snapshot = state.snapshot.clone();
        state.undelivered.push_back(snapshot);
        if state.dispatching {
            return;
        }
        state.dispatching = true;
        loop {
            let Some(snapshot) = state.undelivered.pop_front() else {
                state.dispatching = false;
                return;
            };
            let listeners: Vec<Listener> = state.listeners.values().cloned().collect();
            drop(state);
            for listener in &listeners {
                listener(&snapshot);
            }
            state = self.lock();
        }
    }

    fn start_refresh(
        &self,
        mut state: MutexGuard<'_, State>,
        background: bool,
        force: bool,
    ) -> Option<Shared<BoxFuture<'static, ()>>> {
        if let Some(in_flight) = &state.in_flight {
            return Some(in_flight.done.clone());
        }
        if !force && state.backoff.remaining(Instant::now()).is_some() {
            debug!("inside backoff window, rescheduling only");
            if state.is_active() {
                self.arm_timer(&mut state, false);
            }
            return None;
        }

        state.cancel_timer();
        let epoch = state.epoch;
        let inner = Arc::clone(&self.inner);
        debug!(background, force, epoch, "fetching raffles");
        let handle = tokio::spawn(async move {
            let outcome = inner.feed.fetch_raffles(inner.row_limit).await;
            PollingStore { inner }.complete(epoch, outcome);
        });
        let task = handle.abort_handle();
        let done = async move {
            let _ = handle.await;
        }
        .boxed()
        .shared();
        state.in_flight = Some(InFlight {
            done: done.clone(),
            task,
        });

        if !background || state.snapshot.items.is_none() {
            state.snapshot.is_loading = true;
            self.publish(state);
        }
        Some(done)
    }

    fn complete(&self, epoch: u64, outcome: crate::Result<Vec<RaffleEntity>>) {
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!(epoch, current = state.epoch, "discarding stale fetch result");
            return;
        }
        state.in_flight = None;
        state.snapshot.is_loading = false;

        match outcome {
            Ok(items) => {
                debug!(count = items.len(), "raffles refreshed");
                state.backoff.reset();
                state.snapshot.items = Some(Arc::new(items));
                state.snapshot.note = None;
                state.snapshot.last_updated = Some(Utc::now());
            }
            Err(err) => self.record_failure(&mut state, &err),
        }

        if state.is_active() {
            self.arm_timer(&mut state, false);
        }
        self.publish(state);
    }

    fn record_failure(&self, state: &mut State, err: &Error) {
        let kind = err.failure_kind();
        let Some(policy) = BackoffPolicy::for_kind(kind) else {
            debug!(%err, "fetch cancelled");
            return;
        };
        let delay = state.backoff.record_failure(&policy, Instant::now());
        warn!(
            %err,
            ?kind,
            step = state.backoff.step,
            retry_in = ?delay,
            "raffle fetch failed"
        );
        state.snapshot.note = Some(failure_note(
            kind,
            delay,
            state.snapshot.items.is_some(),
        ));
        state.snapshot.last_error = Some(Utc::now());
    }

    /// Schedules the next background refresh, replacing any pending one.
    /// With `only_if_sooner`, an earlier pending timer is kept.
    fn arm_timer(&self, state: &mut State, only_if_sooner: bool) {
        let now = Instant::now();
        let deadline = now + state.next_delay(now);
        let pending_is_sooner = state
            .timer
            .as_ref()
            .is_some_and(|timer| timer.deadline <= deadline);
        if only_if_sooner && pending_is_sooner {
            return;
        }
        state.cancel_timer();

        let id = state.token();
        let store: Weak<Inner<F>> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = store.upgrade() {
                PollingStore { inner }.on_timer(id);
            }
        });
        state.timer = Some(Timer {
            id,
            deadline,
            handle,
        });
    }

    fn on_timer(&self, id: u64) {
        let mut state = self.lock();
        // A re-arm may have replaced this timer after it fired.
        if state.timer.as_ref().map(|timer| timer.id) != Some(id) {
            return;
        }
        state.timer = None;
        if state.is_active() {
            self.start_refresh(state, true, false);
        }
    }

    fn unsubscribe(&self, token: u64) {
        let mut state = self.lock();
        let Some(subscriber) = state.subscribers.remove(&token) else {
            return;
        };
        debug!(key = %subscriber.key, "subscriber left");
        if state.is_active() {
            return;
        }

        info!("last subscriber left, stopping polling store");
        state.cancel_timer();
        if let Some(in_flight) = state.in_flight.take() {
            in_flight.task.abort();
        }
        state.epoch += 1;
        if state.snapshot.is_loading {
            state.snapshot.is_loading = false;
            self.publish(state);
        }
    }
}

fn failure_note(kind: FailureKind, delay: Duration, has_items: bool) -> String {
    let cause = match kind {
        FailureKind::RateLimited => "Indexer is rate limiting requests",
        _ => "Indexer temporarily unavailable",
    };
    let data = if has_items {
        "showing last known data"
    } else {
        "no data yet"
    };
    format!("{cause}; {data}, retrying in {}s", delay.as_secs())
}
