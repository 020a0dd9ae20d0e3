//! Live queries.
//!
//! Observing a [`Cursor`] keeps its result current while the collection mutates. Every
//! mutation event runs a cheap relevance check against the cursor's selector and the ids
//! of its latest result; relevant events schedule a recompute, and recomputes are debounced
//! so a burst of writes costs a single execution.
//!
//! # Overview
//!
//! Observations live in a [`Reactor`], an arena of observed cursors addressed by
//! generational [`ObserverId`]s. The reactor also owns the scheduler: each observation has
//! at most one pending recompute, backed by a tokio timer. A trigger arriving while a
//! recompute is pending pushes it back by one more interval, until
//! [`batch_size`](Cursor::batch_size) triggers have piled up and the recompute runs at once.
//!
//! Observations of joined cursors form a tree. A child links to its parent by id through a
//! weak reference to the parent's reactor, so teardown order never matters: a child whose
//! parent is gone simply stops propagating. When a child recomputes it asks the parent to
//! re-emit its latest result, without re-executing the parent.
//!
//! # Example
//!
//! ```ignore
//! use livelayer::prelude::*;
//! use bson::doc;
//!
//! let cursor = collection.find(doc! { "done": false })?;
//! let stopper = cursor.observe(|update| {
//!     if let ObserveUpdate::Updated { result, .. } = update {
//!         println!("open tasks: {result}");
//!     }
//! })?;
//!
//! let first = stopper.ready().await?;
//! collection.insert(doc! { "title": "write docs", "done": false }).await?;
//!
//! stopper.stop();
//! ```

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use bson::{Bson, Document};
use futures::{
    FutureExt,
    channel::oneshot,
    future::{BoxFuture, Shared},
};
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    config::CollectionConfig,
    cursor::Cursor,
    error::{DocumentStoreError, DocumentStoreResult},
    events::{MutationEvent, SubscriptionId},
    index::IdKey,
    matcher::Matcher,
    value::{compare, equals, is_truthy},
};

/// Callback receiving the updates of an observation.
pub type ObserveListener = Arc<dyn Fn(&ObserveUpdate) + Send + Sync>;


/// One notification delivered to an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserveUpdate {
    /// The cursor produced a result. `first_run` is set for the update requested by
    /// [`Cursor::observe`] itself.
    Updated { result: Bson, first_run: bool },
    /// A recompute failed. The previous result stays in effect.
    Failed(DocumentStoreError),
    /// The listener was detached, either by its own [`Stopper`] or because the whole
    /// observation ended. It is the last update the listener receives.
    Stopped,
}

impl ObserveUpdate {
    pub fn result(&self) -> Option<&Bson> {
        match self {
            ObserveUpdate::Updated { result, .. } => Some(result),
            ObserveUpdate::Failed(_) | ObserveUpdate::Stopped => None,
        }
    }

    pub fn is_first_run(&self) -> bool {
        matches!(self, ObserveUpdate::Updated { first_run: true, .. })
    }
}

/// Options for [`Cursor::observe_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveOptions {
    /// Register the listener without scheduling an initial update. The listener first hears
    /// from the cursor when a relevant mutation happens.
    pub declare: bool,
}

/// Debounce settings of one cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Schedule {
    pub(crate) wait: Duration,
    pub(crate) batch_size: usize,
}

impl Schedule {
    pub(crate) fn from_config(config: &CollectionConfig) -> Self {
        Self {
            wait: config.debounce_wait(),
            batch_size: config.batch_size,
        }
    }
}

/// Handle of an observed cursor inside a [`Reactor`].
///
/// Slots are reused once an observation ends; the generation tells a stale handle apart
/// from the observation that took its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId {
    index: usize,
    generation: u64,
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    listener: ObserveListener,
    ready: Option<oneshot::Sender<DocumentStoreResult<Bson>>>,
}

struct Pending {
    token: u64,
    calls: usize,
    extend: bool,
    first_run: bool,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn cancel(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

struct Observation {
    cursor: Cursor,
    subscription: Option<SubscriptionId>,
    listeners: Vec<ListenerEntry>,
    latest: Option<Bson>,
    latest_ids: Option<HashSet<IdKey>>,
    parent: Option<ParentLink>,
    children: Vec<Stopper>,
    pending: Option<Pending>,
}

impl Observation {
    fn new(cursor: Cursor) -> Self {
        Self {
            cursor,
            subscription: None,
            listeners: Vec::new(),
            latest: None,
            latest_ids: None,
            parent: None,
            children: Vec::new(),
            pending: None,
        }
    }
}

struct Slot {
    generation: u64,
    observation: Option<Observation>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    next_token: u64,
    next_listener: u64,
    live: usize,
}

impl Arena {
    fn insert(&mut self, observation: Observation) -> ObserverId {
        self.live += 1;

        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                slot.observation = Some(observation);

                ObserverId { index, generation: slot.generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, observation: Some(observation) });

                ObserverId { index: self.slots.len() - 1, generation: 0 }
            }
        }
    }

    fn get(&self, id: ObserverId) -> Option<&Observation> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.observation.as_ref())
    }

    fn get_mut(&mut self, id: ObserverId) -> Option<&mut Observation> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.observation.as_mut())
    }

    fn remove(&mut self, id: ObserverId) -> Option<Observation> {
        let slot = self.slots.get_mut(id.index).filter(|slot| slot.generation == id.generation)?;
        let observation = slot.observation.take()?;

        self.free.push(id.index);
        self.live -= 1;

        Some(observation)
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn listener_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }
}

#[derive(Default)]
pub(crate) struct ReactorInner {
    arena: Mutex<Arena>,
}

/// Outcome of a debounce timer firing.
enum Due {
    Gone,
    Extended,
    Run { first_run: bool },
}

/// Arena and scheduler for observed cursors.
///
/// Every collection owns a reactor; collections built with a shared reactor share one
/// arena. An observation lives until it is stopped: through its last [`Stopper`], through
/// [`Cursor::stop_observers`], or by its parent when it was adopted by a join.
#[derive(Clone, Default)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_weak(weak: &Weak<ReactorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<ReactorInner> {
        Arc::downgrade(&self.inner)
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.inner.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live observations.
    pub fn observer_count(&self) -> usize {
        self.arena().live
    }

    fn observe(&self, cursor: &Cursor, listener: ObserveListener, options: ObserveOptions) -> DocumentStoreResult<Stopper> {
        if Handle::try_current().is_err() {
            tracing::warn!(collection = cursor.db.name(), "cannot observe a cursor outside of a tokio runtime");
            return Err(DocumentStoreError::Runtime("observe(...) requires a tokio runtime".into()));
        }

        let (ready_tx, ready_rx) = oneshot::channel();

        let (id, listener_id) = {
            let mut observer = cursor.state.observer.lock().unwrap_or_else(PoisonError::into_inner);
            let mut arena = self.arena();

            let id = match *observer {
                Some(id) if arena.get(id).is_some() => id,
                _ => {
                    let id = arena.insert(Observation::new(cursor.clone()));
                    let weak = self.downgrade();

                    let subscription = cursor.db.events().subscribe(move |event| {
                        if let Some(reactor) = Reactor::from_weak(&weak) {
                            reactor.maybe_update(id, event);
                        }
                    });

                    if let Some(observation) = arena.get_mut(id) {
                        observation.subscription = Some(subscription);
                    }

                    *observer = Some(id);
                    id
                }
            };

            let listener_id = arena.listener_id();

            if let Some(observation) = arena.get_mut(id) {
                observation.listeners.push(ListenerEntry {
                    id: listener_id,
                    listener,
                    ready: Some(ready_tx),
                });
            }

            (id, listener_id)
        };

        tracing::debug!(
            collection = cursor.db.name(),
            observer = %id,
            declare = options.declare,
            "observing cursor"
        );

        if !options.declare {
            self.schedule(id, true);
        }

        let ready = ready_rx
            .map(|received| received.unwrap_or(Err(DocumentStoreError::Cancelled)))
            .boxed()
            .shared();

        Ok(Stopper {
            inner: Arc::new(StopperInner {
                reactor: self.downgrade(),
                observer: id,
                listener: listener_id,
                stopped: AtomicBool::new(false),
                ready,
            }),
        })
    }

    /// Requests a recompute of an observation, debounced.
    fn schedule(&self, id: ObserverId, first_run: bool) {
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(observer = %id, "cannot schedule a cursor update outside of a tokio runtime");
            return;
        };

        let mut arena = self.arena();
        let token = arena.token();

        let Some(observation) = arena.get_mut(id) else {
            return;
        };

        let batch_size = observation.cursor.schedule().batch_size;

        match observation.pending.as_mut() {
            None => {
                let timer = handle.spawn(debounce_timer(self.downgrade(), id, token));

                observation.pending = Some(Pending {
                    token,
                    calls: 1,
                    extend: false,
                    first_run,
                    timer: Some(timer),
                });

                tracing::trace!(observer = %id, first_run, "cursor update scheduled");
            }
            Some(pending) if batch_size > 0 && pending.calls >= batch_size => {
                let calls = pending.calls + 1;
                let first_run = pending.first_run;

                if let Some(pending) = observation.pending.take() {
                    pending.cancel();
                }

                tracing::debug!(observer = %id, calls, "batch size reached, forcing cursor update");
                handle.spawn(run_update(self.downgrade(), id, first_run));
            }
            Some(pending) => {
                pending.calls += 1;
                pending.extend = true;
            }
        }
    }

    fn pending_wait(&self, id: ObserverId, token: u64) -> Option<Duration> {
        let arena = self.arena();
        let observation = arena.get(id)?;

        match &observation.pending {
            Some(pending) if pending.token == token => Some(observation.cursor.schedule().wait),
            _ => None,
        }
    }

    fn take_due(&self, id: ObserverId, token: u64) -> Due {
        let mut arena = self.arena();

        let Some(observation) = arena.get_mut(id) else {
            return Due::Gone;
        };

        match observation.pending.as_mut() {
            Some(pending) if pending.token == token && pending.extend => {
                pending.extend = false;
                Due::Extended
            }
            Some(pending) if pending.token == token => {
                let first_run = pending.first_run;
                observation.pending = None;
                Due::Run { first_run }
            }
            _ => Due::Gone,
        }
    }

    fn cursor(&self, id: ObserverId) -> Option<Cursor> {
        self.arena().get(id).map(|observation| observation.cursor.clone())
    }

    fn store_latest(&self, id: ObserverId, result: Bson) {
        let mut arena = self.arena();

        if let Some(observation) = arena.get_mut(id) {
            if let Some(ids) = result_ids(&result) {
                observation.latest_ids = Some(ids);
            }
            observation.latest = Some(result);
        }
    }

    /// Emits the latest result of an observation and, unless this is the first run, asks
    /// its parent to do the same.
    fn propagate(&self, id: ObserverId, first_run: bool) {
        let (latest, parent) = {
            let arena = self.arena();

            let Some(observation) = arena.get(id) else {
                return;
            };

            (observation.latest.clone(), observation.parent.clone())
        };

        if let Some(result) = latest {
            self.emit(id, ObserveUpdate::Updated { result, first_run });
        }

        if !first_run {
            if let Some(parent) = parent {
                parent.propagate();
            }
        }
    }

    fn emit(&self, id: ObserverId, update: ObserveUpdate) {
        let (listeners, ready) = {
            let mut arena = self.arena();

            let Some(observation) = arena.get_mut(id) else {
                return;
            };

            let listeners: Vec<ObserveListener> = observation
                .listeners
                .iter()
                .map(|entry| entry.listener.clone())
                .collect();
            let ready: Vec<_> = observation
                .listeners
                .iter_mut()
                .filter_map(|entry| entry.ready.take())
                .collect();

            (listeners, ready)
        };

        for listener in listeners {
            listener(&update);
        }

        let outcome = match &update {
            ObserveUpdate::Updated { result, .. } => Ok(result.clone()),
            ObserveUpdate::Failed(err) => Err(err.clone()),
            ObserveUpdate::Stopped => Err(DocumentStoreError::Cancelled),
        };

        for sender in ready {
            let _ = sender.send(outcome.clone());
        }
    }

    /// Decides whether a mutation can change the result of an observation and schedules
    /// a recompute when it can.
    fn maybe_update(&self, id: ObserverId, event: &MutationEvent) {
        let (cursor, in_latest) = {
            let arena = self.arena();

            let Some(observation) = arena.get(id) else {
                return;
            };

            let in_latest = match (event, &observation.latest_ids) {
                (MutationEvent::Remove { old }, Some(ids)) => {
                    Some(ids.contains(&IdKey::from(old.get("_id").unwrap_or(&Bson::Null))))
                }
                _ => None,
            };

            (observation.cursor.clone(), in_latest)
        };

        if !is_relevant(&cursor.matcher(), event, in_latest) {
            return;
        }

        let children = self
            .arena()
            .get_mut(id)
            .map(|observation| std::mem::take(&mut observation.children))
            .unwrap_or_default();

        for child in children {
            child.stop();
        }

        tracing::debug!(
            collection = cursor.db.name(),
            observer = %id,
            event = event.kind(),
            "mutation affects observed cursor"
        );

        self.schedule(id, false);
    }

    fn remove_listener(&self, id: ObserverId, listener: ListenerId) {
        let (detached, removed) = {
            let mut arena = self.arena();

            let Some(observation) = arena.get_mut(id) else {
                return;
            };

            let detached = observation
                .listeners
                .iter()
                .position(|entry| entry.id == listener)
                .map(|position| observation.listeners.remove(position));

            let removed = if observation.listeners.is_empty() {
                arena.remove(id)
            } else {
                None
            };

            (detached, removed)
        };

        if let Some(entry) = detached {
            (entry.listener)(&ObserveUpdate::Stopped);
        }

        if let Some(observation) = removed {
            self.teardown(id, observation);
        }
    }

    fn stop_all(&self, id: ObserverId) {
        let removed = self.arena().remove(id);

        if let Some(observation) = removed {
            self.teardown(id, observation);
        }
    }

    fn teardown(&self, id: ObserverId, mut observation: Observation) {
        if let Some(pending) = observation.pending.take() {
            pending.cancel();
        }

        if let Some(subscription) = observation.subscription.take() {
            observation.cursor.db.events().unsubscribe(subscription);
        }

        {
            let mut observer = observation.cursor.state.observer.lock().unwrap_or_else(PoisonError::into_inner);

            if *observer == Some(id) {
                *observer = None;
            }
        }

        tracing::debug!(
            collection = observation.cursor.db.name(),
            observer = %id,
            children = observation.children.len(),
            "observation stopped"
        );

        for entry in std::mem::take(&mut observation.listeners) {
            (entry.listener)(&ObserveUpdate::Stopped);
        }

        for child in std::mem::take(&mut observation.children) {
            child.stop();
        }
    }

    fn set_parent(&self, id: ObserverId, parent: ParentLink) {
        if let Some(observation) = self.arena().get_mut(id) {
            observation.parent = Some(parent);
        }
    }

    fn add_child(&self, id: ObserverId, child: Stopper) {
        let orphan = {
            let mut arena = self.arena();

            match arena.get_mut(id) {
                Some(observation) => {
                    observation.children.push(child);
                    None
                }
                None => Some(child),
            }
        };

        if let Some(child) = orphan {
            child.stop();
        }
    }

    fn patch_latest<F>(&self, id: ObserverId, index: usize, patch: F)
    where
        F: FnOnce(&mut Bson),
    {
        let mut arena = self.arena();

        let Some(latest) = arena.get_mut(id).and_then(|observation| observation.latest.as_mut()) else {
            return;
        };

        match latest {
            Bson::Array(values) if index < values.len() => patch(&mut values[index]),
            other => patch(other),
        }
    }

    fn latest(&self, id: ObserverId) -> Option<Bson> {
        self.arena().get(id).and_then(|observation| observation.latest.clone())
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("observers", &self.observer_count())
            .finish()
    }
}

async fn debounce_timer(reactor: Weak<ReactorInner>, id: ObserverId, token: u64) {
    loop {
        let Some(wait) = Reactor::from_weak(&reactor).and_then(|r| r.pending_wait(id, token)) else {
            return;
        };

        tokio::time::sleep(wait).await;

        let Some(due) = Reactor::from_weak(&reactor).map(|r| r.take_due(id, token)) else {
            return;
        };

        match due {
            Due::Gone => return,
            Due::Extended => continue,
            Due::Run { first_run } => {
                run_update(reactor, id, first_run).await;
                return;
            }
        }
    }
}

async fn run_update(reactor: Weak<ReactorInner>, id: ObserverId, first_run: bool) {
    let Some(cursor) = Reactor::from_weak(&reactor).and_then(|r| r.cursor(id)) else {
        return;
    };

    let outcome = cursor.exec().await;

    let Some(reactor) = Reactor::from_weak(&reactor) else {
        return;
    };

    match outcome {
        Ok(result) => {
            reactor.store_latest(id, result);
            reactor.propagate(id, first_run);
        }
        Err(err) => {
            tracing::warn!(
                collection = cursor.db.name(),
                observer = %id,
                error = %err,
                "observed cursor failed to update"
            );
            reactor.emit(id, ObserveUpdate::Failed(err));
        }
    }
}

/// Ids of the documents in a result. Results that are neither an array nor a document
/// with an `_id` keep the previous ids.
fn result_ids(result: &Bson) -> Option<HashSet<IdKey>> {
    match result {
        Bson::Array(values) => Some(
            values
                .iter()
                .map(|value| {
                    let id = value.as_document().and_then(|doc| doc.get("_id"));
                    IdKey::from(id.unwrap_or(&Bson::Undefined))
                })
                .collect()
        ),
        Bson::Document(doc) if is_truthy(doc.get("_id")) => {
            Some(doc.get("_id").map(IdKey::from).into_iter().collect())
        }
        _ => None,
    }
}

fn matches_or_unknown(matcher: &Matcher, doc: &Document) -> bool {
    matcher.document_matches(doc).map(|m| m.result).unwrap_or(true)
}

fn is_newer(new: &Document, old: &Document) -> bool {
    let new_at = new.get("updatedAt");

    if !is_truthy(new_at) {
        return false;
    }

    let old_at = old.get("updatedAt");

    !is_truthy(old_at) || compare(new_at, old_at).is_ok_and(|ordering| ordering.is_gt())
}

/// The relevance heuristic. It may report irrelevant events as relevant, never the reverse.
fn is_relevant(matcher: &Matcher, event: &MutationEvent, in_latest: Option<bool>) -> bool {
    match event {
        MutationEvent::Remove { old } => in_latest.unwrap_or(true) || matches_or_unknown(matcher, old),
        MutationEvent::Update { new, old } => {
            (matches_or_unknown(matcher, new) || matches_or_unknown(matcher, old))
                && (new.len() != old.len()
                    || is_newer(new, old)
                    || !equals(&Bson::Document(new.clone()), &Bson::Document(old.clone())))
        }
        MutationEvent::Insert { doc } => matches_or_unknown(matcher, doc),
    }
}

/// Weak back-reference from a child observation to its parent.
#[derive(Clone)]
pub(crate) struct ParentLink {
    reactor: Weak<ReactorInner>,
    id: ObserverId,
}

impl ParentLink {
    pub(crate) fn new(reactor: &Reactor, id: ObserverId) -> Self {
        Self { reactor: reactor.downgrade(), id }
    }

    pub(crate) fn propagate(&self) {
        if let Some(reactor) = Reactor::from_weak(&self.reactor) {
            reactor.propagate(self.id, false);
        }
    }

    pub(crate) fn adopt(&self, child: &Stopper) {
        let Some(reactor) = Reactor::from_weak(&self.reactor) else {
            return;
        };

        if let Some(child_reactor) = Reactor::from_weak(&child.inner.reactor) {
            child_reactor.set_parent(child.inner.observer, self.clone());
        }

        reactor.add_child(self.id, child.clone());
    }

    pub(crate) fn patch_latest<F>(&self, index: usize, patch: F)
    where
        F: FnOnce(&mut Bson),
    {
        if let Some(reactor) = Reactor::from_weak(&self.reactor) {
            reactor.patch_latest(self.id, index, patch);
        }
    }
}

impl fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ParentLink").field(&self.id).finish()
    }
}

struct StopperInner {
    reactor: Weak<ReactorInner>,
    observer: ObserverId,
    listener: ListenerId,
    stopped: AtomicBool,
    ready: Shared<BoxFuture<'static, DocumentStoreResult<Bson>>>,
}

/// Cancellation handle of one observation listener.
///
/// Clones share the same listener; stopping any clone stops it.
#[derive(Clone)]
pub struct Stopper {
    inner: Arc<StopperInner>,
}

impl Stopper {
    /// Removes the listener. Stopping the last listener of a cursor ends its observation:
    /// the event subscription is removed, any pending update is cancelled and adopted
    /// children are stopped. The listener receives [`ObserveUpdate::Stopped`] as its last
    /// update. Stopping twice is a no-op.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(reactor) = Reactor::from_weak(&self.inner.reactor) {
            reactor.remove_listener(self.inner.observer, self.inner.listener);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The observation this listener belongs to.
    pub fn observer(&self) -> ObserverId {
        self.inner.observer
    }

    /// Waits for the first update delivered to this listener.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed first update, or [`DocumentStoreError::Cancelled`]
    /// when the listener was stopped before any update arrived.
    pub async fn ready(&self) -> DocumentStoreResult<Bson> {
        self.inner.ready.clone().await
    }
}

impl fmt::Debug for Stopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stopper")
            .field("observer", &self.inner.observer)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Cursor {
    /// Observes the cursor and schedules its first update.
    ///
    /// `listener` receives every result the cursor produces from now on, and every failed
    /// recompute. Observing an already observed cursor adds a listener to the same
    /// observation.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Runtime`] outside of a tokio runtime.
    pub fn observe<F>(&self, listener: F) -> DocumentStoreResult<Stopper>
    where
        F: Fn(&ObserveUpdate) + Send + Sync + 'static,
    {
        self.observe_with(listener, ObserveOptions::default())
    }

    /// Observes the cursor with explicit options.
    pub fn observe_with<F>(&self, listener: F, options: ObserveOptions) -> DocumentStoreResult<Stopper>
    where
        F: Fn(&ObserveUpdate) + Send + Sync + 'static,
    {
        self.db.reactor().observe(self, Arc::new(listener), options)
    }

    /// Stops every listener of this cursor and cancels its pending update.
    pub fn stop_observers(&self) {
        let observer = *self.state.observer.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(id) = observer {
            self.db.reactor().stop_all(id);
        }
    }

    /// Sets how many triggers may pile up before a pending update runs immediately.
    /// `0` never forces an update.
    pub fn batch_size(&self, batch_size: usize) -> &Self {
        self.state.schedule.lock().unwrap_or_else(PoisonError::into_inner).batch_size = batch_size;
        self
    }

    /// Sets the debounce interval of updates.
    pub fn debounce(&self, wait: Duration) -> &Self {
        self.state.schedule.lock().unwrap_or_else(PoisonError::into_inner).wait = wait;
        self
    }

    pub(crate) fn schedule(&self) -> Schedule {
        *self.state.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the cursor currently has an observation.
    pub fn is_observed(&self) -> bool {
        let observer = *self.state.observer.lock().unwrap_or_else(PoisonError::into_inner);
        observer.is_some_and(|id| self.db.reactor().arena().get(id).is_some())
    }

    /// The latest result delivered to the observers of this cursor.
    pub fn latest(&self) -> Option<Bson> {
        let observer = *self.state.observer.lock().unwrap_or_else(PoisonError::into_inner);
        observer.and_then(|id| self.db.reactor().latest(id))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::collection;
    use bson::doc;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<ObserveUpdate>>>;

    fn recorder() -> (Seen, impl Fn(&ObserveUpdate) + Send + Sync + 'static) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        (seen, move |update: &ObserveUpdate| sink.lock().unwrap().push(update.clone()))
    }

    fn ids(result: &Bson) -> Vec<Bson> {
        result
            .as_array()
            .unwrap()
            .iter()
            .map(|doc| doc.as_document().unwrap().get("_id").unwrap().clone())
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_update_is_debounced() {
        let db = collection("tasks").await;
        db.insert(doc! { "_id": "a", "done": false }).await.unwrap();

        let cursor = db.find(doc! { "done": false }).unwrap();
        let (seen, listener) = recorder();
        let stopper = cursor.observe(listener).unwrap();

        assert!(seen.lock().unwrap().is_empty());

        let first = stopper.ready().await.unwrap();
        assert_eq!(ids(&first), vec![Bson::from("a")]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_first_run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_collapsed() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! {}).unwrap();
        let (seen, listener) = recorder();

        let stopper = cursor.observe(listener).unwrap();
        stopper.ready().await.unwrap();

        for i in 0..3 {
            db.insert(doc! { "n": i }).await.unwrap();
        }
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].result().unwrap().as_array().unwrap().len(), 3);
        assert!(!seen[1].is_first_run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_forces_update() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! {}).unwrap();
        cursor.batch_size(2).debounce(Duration::from_secs(60));

        let (seen, listener) = recorder();
        let stopper = cursor.observe(listener).unwrap();
        stopper.ready().await.unwrap();

        for i in 0..3 {
            db.insert(doc! { "n": i }).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].result().unwrap().as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_irrelevant_mutations_are_ignored() {
        let db = collection("tasks").await;
        db.insert(doc! { "_id": "a", "done": false }).await.unwrap();
        db.insert(doc! { "_id": "b", "done": true }).await.unwrap();

        let cursor = db.find(doc! { "done": false }).unwrap();
        let (seen, listener) = recorder();
        let stopper = cursor.observe(listener).unwrap();
        stopper.ready().await.unwrap();

        db.insert(doc! { "_id": "c", "done": true }).await.unwrap();
        db.update(doc! { "_id": "b" }, doc! { "$set": { "title": "x" } }).await.unwrap();
        db.update(doc! { "_id": "a" }, doc! { "$set": { "done": false } }).await.unwrap();
        db.remove(doc! { "_id": "c" }, Default::default()).await.unwrap();
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);

        db.remove(doc! { "_id": "a" }, Default::default()).await.unwrap();
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].result(), Some(&Bson::Array(vec![])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_final() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! {}).unwrap();
        let (seen, listener) = recorder();

        let stopper = cursor.observe(listener).unwrap();
        stopper.ready().await.unwrap();
        assert!(cursor.is_observed());
        assert_eq!(db.events().listener_count(), 1);

        stopper.stop();
        stopper.stop();

        assert!(stopper.is_stopped());
        assert!(!cursor.is_observed());
        assert_eq!(db.events().listener_count(), 0);
        assert_eq!(db.reactor().observer_count(), 0);

        db.insert(doc! { "n": 1 }).await.unwrap();
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], ObserveUpdate::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_notifies_only_the_detached_listener() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! {}).unwrap();
        let (first_seen, first_listener) = recorder();
        let (second_seen, second_listener) = recorder();

        let first = cursor.observe(first_listener).unwrap();
        let second = cursor.observe(second_listener).unwrap();
        first.ready().await.unwrap();

        first.stop();
        assert!(cursor.is_observed());
        assert_eq!(first_seen.lock().unwrap().last(), Some(&ObserveUpdate::Stopped));
        assert!(!second_seen.lock().unwrap().contains(&ObserveUpdate::Stopped));

        second.stop();
        assert!(!cursor.is_observed());

        let second_seen = second_seen.lock().unwrap();
        assert_eq!(second_seen.len(), 2);
        assert_eq!(second_seen[1], ObserveUpdate::Stopped);
        assert_eq!(first_seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_observers_cancels_pending_update() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! {}).unwrap();
        let (seen, listener) = recorder();

        let first = cursor.observe(listener).unwrap();
        let second = cursor.observe(|_| {}).unwrap();
        assert_eq!(first.observer(), second.observer());

        cursor.stop_observers();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![ObserveUpdate::Stopped]);
        assert_eq!(first.ready().await, Err(DocumentStoreError::Cancelled));
        assert_eq!(second.ready().await, Err(DocumentStoreError::Cancelled));

        first.stop();
        assert_eq!(db.reactor().observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declare_waits_for_mutation() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! {}).unwrap();
        let (seen, listener) = recorder();

        let stopper = cursor
            .observe_with(listener, ObserveOptions { declare: true })
            .unwrap();
        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        db.insert(doc! { "_id": "a" }).await.unwrap();

        let result = stopper.ready().await.unwrap();
        assert_eq!(ids(&result), vec![Bson::from("a")]);
        assert!(!seen.lock().unwrap()[0].is_first_run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_keeps_latest_result() {
        let db = collection("tasks").await;
        db.insert(doc! { "_id": 1, "v": 1 }).await.unwrap();

        let cursor = db.find(doc! {}).unwrap();
        cursor.sort(doc! { "v": 1 }).unwrap();

        let (seen, listener) = recorder();
        let stopper = cursor.observe(listener).unwrap();
        let first = stopper.ready().await.unwrap();

        db.insert(doc! { "_id": 2, "v": Bson::JavaScriptCode("a()".into()) }).await.unwrap();
        db.insert(doc! { "_id": 3, "v": Bson::JavaScriptCode("b()".into()) }).await.unwrap();
        settle().await;

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert!(matches!(seen[1], ObserveUpdate::Failed(DocumentStoreError::Evaluation(_))));
        }
        assert_eq!(cursor.latest(), Some(first));

        db.remove(doc! { "_id": 3 }, Default::default()).await.unwrap();
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(ids(seen[2].result().unwrap()), vec![Bson::Int32(1), Bson::Int32(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updated_at_and_field_count_heuristics() {
        let db = collection("tasks").await;
        let cursor = db.find(doc! { "kind": "note" }).unwrap();
        let matcher = cursor.matcher();

        let old = doc! { "_id": 1, "kind": "note", "updatedAt": 1 };
        let update = |new: Document| MutationEvent::Update { new, old: old.clone() };

        assert!(!is_relevant(&matcher, &update(old.clone()), None));
        assert!(is_relevant(&matcher, &update(doc! { "_id": 1, "kind": "note", "updatedAt": 2 }), None));
        assert!(is_relevant(&matcher, &update(doc! { "_id": 1, "kind": "note", "updatedAt": 1, "x": 1 }), None));
        assert!(is_relevant(&matcher, &update(doc! { "_id": 1, "kind": "memo", "updatedAt": 1 }), None));
        assert!(!is_relevant(&matcher, &MutationEvent::Update {
            new: doc! { "_id": 1, "kind": "memo", "v": 2 },
            old: doc! { "_id": 1, "kind": "memo", "v": 1 },
        }, None));

        let gone = MutationEvent::Remove { old: doc! { "_id": 9, "kind": "memo" } };
        assert!(!is_relevant(&matcher, &gone, Some(false)));
        assert!(is_relevant(&matcher, &gone, Some(true)));
        assert!(is_relevant(&matcher, &gone, None));
    }

    #[test]
    fn test_observe_requires_runtime() {
        futures::executor::block_on(async {
            let db = collection("tasks").await;
            let cursor = db.find(doc! {}).unwrap();

            assert!(matches!(cursor.observe(|_| {}), Err(DocumentStoreError::Runtime(_))));
            assert_eq!(db.reactor().observer_count(), 0);
        });
    }

    #[test]
    fn test_arena_reuses_slots_with_new_generation() {
        let mut arena = Arena::default();

        futures::executor::block_on(async {
            let db = collection("tasks").await;
            let cursor = db.find(doc! {}).unwrap();

            let first = arena.insert(Observation::new(cursor.clone()));
            assert!(arena.remove(first).is_some());

            let second = arena.insert(Observation::new(cursor));
            assert_eq!(first.index, second.index);
            assert_ne!(first, second);
            assert!(arena.get(first).is_none());
            assert!(arena.get(second).is_some());
            assert!(arena.remove(first).is_none());
        });
    }
}
