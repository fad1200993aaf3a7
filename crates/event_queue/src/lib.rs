//! Registry that parks completion callbacks for server-side operations until the
//! event stream reports them finished.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use shared::domain::OperationId;
use thiserror::Error;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub mod settled;

pub use settled::{settled_counts, BulkCompletion, BulkTracker, Settled, SettledCounts};

pub const DEFAULT_REGISTRATION_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_EARLY_COMPLETION_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BUFFERED_COMPLETIONS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Failure(String),
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

type SuccessCallback = Box<dyn FnOnce() + Send>;
type FailureCallback = Box<dyn FnOnce(String) + Send>;
type FinishCallback = Box<dyn FnOnce() + Send>;

/// The success/failure/finish triple parked for one operation.
pub struct OperationCallbacks {
    on_success: SuccessCallback,
    on_failure: FailureCallback,
    on_finish: Option<FinishCallback>,
}

impl OperationCallbacks {
    pub fn new<S, F>(on_success: S, on_failure: F) -> Self
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        Self {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
            on_finish: None,
        }
    }

    pub fn on_finish<D>(mut self, on_finish: D) -> Self
    where
        D: FnOnce() + Send + 'static,
    {
        self.on_finish = Some(Box::new(on_finish));
        self
    }

    fn fire(self, outcome: OperationOutcome) {
        match outcome {
            OperationOutcome::Success => (self.on_success)(),
            OperationOutcome::Failure(message) => (self.on_failure)(message),
        }
        if let Some(on_finish) = self.on_finish {
            on_finish();
        }
    }
}

impl fmt::Debug for OperationCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCallbacks")
            .field("has_on_finish", &self.on_finish.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Registrations older than this fail with a timeout. `None` keeps them until resolved.
    pub registration_ttl: Option<Duration>,
    /// How long a completion for an unregistered id is kept for a late `register`.
    /// Zero drops such completions immediately.
    pub early_completion_grace: Duration,
    pub max_buffered_completions: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            registration_ttl: Some(DEFAULT_REGISTRATION_TTL),
            early_completion_grace: DEFAULT_EARLY_COMPLETION_GRACE,
            max_buffered_completions: DEFAULT_MAX_BUFFERED_COMPLETIONS,
        }
    }
}

/// Identifies one registration; re-registering the same id issues a new generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationToken {
    operation_id: OperationId,
    generation: u64,
}

impl RegistrationToken {
    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("operation {0} was abandoned before it completed")]
    Abandoned(OperationId),
    #[error("bulk action over {expected} operations was abandoned before all settled")]
    BulkAbandoned { expected: usize },
}

struct Registration {
    generation: u64,
    callbacks: OperationCallbacks,
    expires_at: Option<Instant>,
}

struct BufferedCompletion {
    operation_id: OperationId,
    outcome: OperationOutcome,
    received_at: Instant,
}

#[derive(Default)]
struct QueueState {
    registrations: HashMap<OperationId, Registration>,
    buffered: VecDeque<BufferedCompletion>,
    next_generation: u64,
}

impl QueueState {
    fn take_expired(
        &mut self,
        now: Instant,
        settings: &QueueSettings,
    ) -> Vec<(OperationId, OperationCallbacks)> {
        let grace = settings.early_completion_grace;
        self.buffered
            .retain(|completion| now.saturating_duration_since(completion.received_at) < grace);

        let expired_ids: Vec<OperationId> = self
            .registrations
            .iter()
            .filter(|(_, registration)| {
                registration
                    .expires_at
                    .is_some_and(|expires_at| expires_at <= now)
            })
            .map(|(operation_id, _)| operation_id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|operation_id| {
                self.registrations
                    .remove(&operation_id)
                    .map(|registration| (operation_id, registration.callbacks))
            })
            .collect()
    }

    fn take_buffered(&mut self, operation_id: &OperationId) -> Option<OperationOutcome> {
        let index = self
            .buffered
            .iter()
            .position(|completion| &completion.operation_id == operation_id)?;
        self.buffered
            .remove(index)
            .map(|completion| completion.outcome)
    }

    fn buffer(&mut self, completion: BufferedCompletion, settings: &QueueSettings) {
        if settings.early_completion_grace.is_zero() || settings.max_buffered_completions == 0 {
            debug!(
                operation_id = %completion.operation_id,
                "dropping completion for unregistered operation"
            );
            return;
        }

        self.buffered
            .retain(|existing| existing.operation_id != completion.operation_id);
        self.buffered.push_back(completion);
        while self.buffered.len() > settings.max_buffered_completions {
            if let Some(evicted) = self.buffered.pop_front() {
                debug!(
                    operation_id = %evicted.operation_id,
                    "evicting oldest buffered completion"
                );
            }
        }
    }
}

struct QueueInner {
    settings: QueueSettings,
    state: Mutex<QueueState>,
}

/// Session-scoped registry of operation callbacks. Cloning yields another handle to the
/// same registry.
///
/// Callbacks always run after the internal lock is released, so they may register or
/// resolve operations on the same queue.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("settings", &self.inner.settings)
            .field("pending", &self.pending_count())
            .field("buffered", &self.buffered_count())
            .finish()
    }
}

impl EventQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                settings,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks `on_success`/`on_failure`/`on_finish` until `operation_id` completes,
    /// replacing any earlier registration for the same id.
    pub fn register<S, F, D>(
        &self,
        operation_id: impl Into<OperationId>,
        on_success: S,
        on_failure: F,
        on_finish: D,
    ) -> RegistrationToken
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(String) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        self.register_callbacks(
            operation_id,
            OperationCallbacks::new(on_success, on_failure).on_finish(on_finish),
        )
    }

    pub fn register_callbacks(
        &self,
        operation_id: impl Into<OperationId>,
        callbacks: OperationCallbacks,
    ) -> RegistrationToken {
        let operation_id = operation_id.into();
        let settings = &self.inner.settings;
        let now = Instant::now();

        let (token, early, replaced, expired) = {
            let mut state = self.lock();
            let expired = state.take_expired(now, settings);
            state.next_generation += 1;
            let token = RegistrationToken {
                operation_id: operation_id.clone(),
                generation: state.next_generation,
            };

            match state.take_buffered(&operation_id) {
                Some(outcome) => (token, Some((callbacks, outcome)), None, expired),
                None => {
                    let replaced = state.registrations.insert(
                        operation_id.clone(),
                        Registration {
                            generation: token.generation,
                            callbacks,
                            // A deadline past the clock's range never expires.
                            expires_at: settings
                                .registration_ttl
                                .and_then(|ttl| now.checked_add(ttl)),
                        },
                    );
                    (token, None, replaced, expired)
                }
            }
        };

        if replaced.is_some() {
            debug!(%operation_id, "replaced existing registration");
        }
        drop(replaced);
        fire_expired(expired);

        if let Some((callbacks, outcome)) = early {
            info!(
                %operation_id,
                success = outcome.is_success(),
                "operation completed before registration; firing buffered completion"
            );
            callbacks.fire(outcome);
        }

        token
    }

    /// Fires and removes the registration for `operation_id`. Returns whether one existed.
    ///
    /// A completion with no registration is kept for the early-completion grace period.
    pub fn resolve(&self, operation_id: &OperationId, outcome: OperationOutcome) -> bool {
        let settings = &self.inner.settings;
        let now = Instant::now();

        let (registration, expired) = {
            let mut state = self.lock();
            let expired = state.take_expired(now, settings);
            let registration = state.registrations.remove(operation_id);
            if registration.is_none() {
                state.buffer(
                    BufferedCompletion {
                        operation_id: operation_id.clone(),
                        outcome: outcome.clone(),
                        received_at: now,
                    },
                    settings,
                );
            }
            (registration, expired)
        };

        fire_expired(expired);

        match registration {
            Some(registration) => {
                debug!(
                    %operation_id,
                    success = outcome.is_success(),
                    "resolving registered operation"
                );
                registration.callbacks.fire(outcome);
                true
            }
            None => false,
        }
    }

    /// Removes the registration `token` was issued for, without firing anything.
    /// A token whose id has since been re-registered cancels nothing.
    pub fn cancel(&self, token: &RegistrationToken) -> bool {
        let removed = {
            let mut state = self.lock();
            let is_current = state
                .registrations
                .get(&token.operation_id)
                .is_some_and(|registration| registration.generation == token.generation);
            if is_current {
                state.registrations.remove(&token.operation_id)
            } else {
                None
            }
        };

        match removed {
            Some(_) => {
                debug!(operation_id = %token.operation_id, "registration cancelled");
                true
            }
            None => false,
        }
    }

    /// Fails every registration past its deadline and drops stale buffered completions.
    pub fn sweep_expired(&self) -> usize {
        let expired = {
            let mut state = self.lock();
            state.take_expired(Instant::now(), &self.inner.settings)
        };
        let count = expired.len();
        fire_expired(expired);
        count
    }

    /// Runs [`EventQueue::sweep_expired`] every `interval` until the last queue handle drops.
    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                EventQueue { inner }.sweep_expired();
            }
        })
    }

    /// Registers a waiter that yields the outcome of `operation_id`.
    pub fn wait_for(&self, operation_id: impl Into<OperationId>) -> OperationWaiter {
        let (tx, receiver) = oneshot::channel();
        let success_slot = Arc::new(Mutex::new(Some(tx)));
        let failure_slot = Arc::clone(&success_slot);

        let token = self.register_callbacks(
            operation_id,
            OperationCallbacks::new(
                move || send_outcome(&success_slot, OperationOutcome::Success),
                move |message| send_outcome(&failure_slot, OperationOutcome::Failure(message)),
            ),
        );

        OperationWaiter { token, receiver }
    }

    pub fn is_pending(&self, operation_id: &OperationId) -> bool {
        self.lock().registrations.contains_key(operation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().registrations.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.lock().buffered.len()
    }
}

fn fire_expired(expired: Vec<(OperationId, OperationCallbacks)>) {
    for (operation_id, callbacks) in expired {
        warn!(%operation_id, "registration expired without a completion event");
        callbacks.fire(OperationOutcome::Failure(format!(
            "operation {operation_id} timed out waiting for completion"
        )));
    }
}

fn send_outcome(
    slot: &Mutex<Option<oneshot::Sender<OperationOutcome>>>,
    outcome: OperationOutcome,
) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

/// Future returned by [`EventQueue::wait_for`].
#[derive(Debug)]
pub struct OperationWaiter {
    token: RegistrationToken,
    receiver: oneshot::Receiver<OperationOutcome>,
}

impl OperationWaiter {
    pub fn token(&self) -> &RegistrationToken {
        &self.token
    }
}

impl Future for OperationWaiter {
    type Output = Result<OperationOutcome, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|result| {
                result.map_err(|_| WaitError::Abandoned(this.token.operation_id.clone()))
            })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
