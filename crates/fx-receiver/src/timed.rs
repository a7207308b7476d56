//! Timed effect scheduling.
//!
//! Effects that run for a duration are serialized per *effect group*
//! (defaulting to the effect name): one running member per group, the rest
//! parked in a FIFO queue. The scheduler owns the registry; all registry
//! mutations happen under its mutex, while packet emissions and user
//! callbacks run outside it.
//!
//! Lifecycle:
//!
//! ```text
//! Created --queue()--> Queued ----------+
//!    |                                  | head of queue starts
//!    +--queue()--> Running <------------+
//!                    |  ^
//!              pause()  resume()
//!                    v  |
//!                  Paused
//!                    |
//!   complete() / timer ----> Completed
//! ```

use crate::error::TimedEffectError;
use crate::router::EffectRequest;
use fx_protocol::{Response, ResponseBuilder, ResultType, Target};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

type StartCallback = Box<dyn Fn(&TimedEffect) -> ResponseBuilder + Send + Sync>;
type EffectCallback = Box<dyn Fn(&TimedEffect) + Send + Sync>;

/// Where a timed effect is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedEffectState {
    Created,
    Queued,
    Running,
    Paused,
    Completed,
}

impl TimedEffectState {
    fn name(self) -> &'static str {
        match self {
            TimedEffectState::Created => "created",
            TimedEffectState::Queued => "queued",
            TimedEffectState::Running => "running",
            TimedEffectState::Paused => "paused",
            TimedEffectState::Completed => "completed",
        }
    }
}

/// Registry of timed effect groups. One per receiver; teardown is explicit
/// via [`shutdown`](TimedEffectScheduler::shutdown) rather than relying on
/// process exit.
#[derive(Clone, Default)]
pub struct TimedEffectScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    groups: std::sync::Mutex<HashMap<String, Group>>,
}

#[derive(Default)]
struct Group {
    active: Option<Arc<EffectEntry>>,
    queue: VecDeque<Arc<EffectEntry>>,
}

impl TimedEffectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a timed effect registered against this scheduler.
    pub fn timed_effect(&self) -> TimedEffectBuilder {
        TimedEffectBuilder {
            scheduler: Arc::downgrade(&self.inner),
            request: None,
            group: None,
            duration: None,
            on_start: None,
            on_pause: None,
            on_resume: None,
            on_complete: None,
            blocks: true,
            waits: true,
        }
    }

    /// Whether some group currently has a running or paused member matching
    /// `effect` whose targets intersect `targets`. An empty query target set
    /// matches any member; a member with no targets is global and matches
    /// any query.
    pub fn is_active(&self, effect: &str, targets: &[Target]) -> bool {
        let effect = effect.to_lowercase();
        let groups = self.inner.groups.lock().expect("scheduler mutex");
        groups.values().any(|group| {
            group.active.as_ref().is_some_and(|entry| {
                let phase = entry.state.lock().expect("effect state").phase;
                matches!(phase, TimedEffectState::Running | TimedEffectState::Paused)
                    && entry.request.effect.as_deref() == Some(effect.as_str())
                    && (targets.is_empty()
                        || entry.request.targets.is_empty()
                        || entry
                            .request
                            .targets
                            .iter()
                            .any(|t| targets.iter().any(|q| t.overlaps(q))))
            })
        })
    }

    /// Tear the registry down: cancel timers, clear every queue, and mark
    /// all entries completed without emitting packets.
    pub fn shutdown(&self) {
        let mut groups = self.inner.groups.lock().expect("scheduler mutex");
        for (_, group) in groups.drain() {
            for entry in group.active.into_iter().chain(group.queue) {
                let mut state = entry.state.lock().expect("effect state");
                state.phase = TimedEffectState::Completed;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
        }
    }
}

/// Builder for [`TimedEffect`]. Request and start callback are required;
/// the duration falls back to the request's own duration field.
pub struct TimedEffectBuilder {
    scheduler: Weak<SchedulerInner>,
    request: Option<EffectRequest>,
    group: Option<String>,
    duration: Option<Duration>,
    on_start: Option<StartCallback>,
    on_pause: Option<EffectCallback>,
    on_resume: Option<EffectCallback>,
    on_complete: Option<EffectCallback>,
    blocks: bool,
    waits: bool,
}

impl TimedEffectBuilder {
    pub fn request(mut self, request: EffectRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Scheduler key; defaults to the request's effect name.
    pub fn group(mut self, group: impl AsRef<str>) -> Self {
        self.group = Some(group.as_ref().to_lowercase());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Required. Returns the response builder seed the SUCCESS emission is
    /// stamped onto; use [`EffectRequest::response`] as the starting point.
    pub fn on_start(
        mut self,
        callback: impl Fn(&TimedEffect) -> ResponseBuilder + Send + Sync + 'static,
    ) -> Self {
        self.on_start = Some(Box::new(callback));
        self
    }

    pub fn on_pause(mut self, callback: impl Fn(&TimedEffect) + Send + Sync + 'static) -> Self {
        self.on_pause = Some(Box::new(callback));
        self
    }

    pub fn on_resume(mut self, callback: impl Fn(&TimedEffect) + Send + Sync + 'static) -> Self {
        self.on_resume = Some(Box::new(callback));
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&TimedEffect) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Advisory: whether this effect should block others in its group.
    pub fn blocks(mut self, blocks: bool) -> Self {
        self.blocks = blocks;
        self
    }

    /// Advisory: whether this effect is willing to wait in the queue.
    pub fn waits(mut self, waits: bool) -> Self {
        self.waits = waits;
        self
    }

    pub fn build(self) -> Result<TimedEffect, TimedEffectError> {
        let request = self.request.ok_or(TimedEffectError::Missing("request"))?;
        let on_start = self
            .on_start
            .ok_or(TimedEffectError::Missing("start callback"))?;
        let duration = self
            .duration
            .or(request.duration)
            .ok_or(TimedEffectError::Missing("duration"))?;
        let group = self
            .group
            .or_else(|| request.effect.clone())
            .ok_or(TimedEffectError::Missing("group"))?;
        Ok(TimedEffect {
            entry: Arc::new(EffectEntry {
                scheduler: self.scheduler,
                request,
                group,
                duration,
                blocks: self.blocks,
                waits: self.waits,
                on_start,
                on_pause: self.on_pause,
                on_resume: self.on_resume,
                on_complete: self.on_complete,
                state: std::sync::Mutex::new(EntryState {
                    phase: TimedEffectState::Created,
                    remaining: duration,
                    started_at: None,
                    timer_gen: 0,
                    timer: None,
                }),
            }),
        })
    }
}

/// A duration-bearing effect serialized within its group.
#[derive(Clone)]
pub struct TimedEffect {
    entry: Arc<EffectEntry>,
}

struct EffectEntry {
    scheduler: Weak<SchedulerInner>,
    request: EffectRequest,
    group: String,
    duration: Duration,
    blocks: bool,
    waits: bool,
    on_start: StartCallback,
    on_pause: Option<EffectCallback>,
    on_resume: Option<EffectCallback>,
    on_complete: Option<EffectCallback>,
    state: std::sync::Mutex<EntryState>,
}

struct EntryState {
    phase: TimedEffectState,
    /// Duration not yet elapsed; updated when the effect pauses.
    remaining: Duration,
    started_at: Option<Instant>,
    /// Bumped on every start/pause/resume so a stale timer task cannot
    /// complete the wrong incarnation.
    timer_gen: u64,
    timer: Option<JoinHandle<()>>,
}

enum QueueDecision {
    StartNow,
    Parked,
}

impl TimedEffect {
    pub fn state(&self) -> TimedEffectState {
        self.entry.state.lock().expect("effect state").phase
    }

    pub fn request(&self) -> &EffectRequest {
        &self.entry.request
    }

    pub fn group(&self) -> &str {
        &self.entry.group
    }

    pub fn duration(&self) -> Duration {
        self.entry.duration
    }

    /// Duration left on the clock: frozen while paused, live while running.
    pub fn remaining(&self) -> Duration {
        let state = self.entry.state.lock().expect("effect state");
        match state.started_at {
            Some(started_at) => state.remaining.saturating_sub(started_at.elapsed()),
            None => state.remaining,
        }
    }

    pub fn blocks(&self) -> bool {
        self.entry.blocks
    }

    pub fn waits(&self) -> bool {
        self.entry.waits
    }

    /// Register with the group: start immediately when the group is free,
    /// otherwise park in the queue and emit a single QUEUE intermediate.
    /// Callable exactly once per effect.
    pub async fn queue(&self) -> Result<(), TimedEffectError> {
        let Some(scheduler) = self.entry.scheduler.upgrade() else {
            return Err(TimedEffectError::IllegalState {
                op: "queue",
                actual: "detached from its scheduler",
            });
        };
        let decision = {
            let mut groups = scheduler.groups.lock().expect("scheduler mutex");
            {
                let state = self.entry.state.lock().expect("effect state");
                if state.phase != TimedEffectState::Created {
                    return Err(TimedEffectError::IllegalState {
                        op: "queue",
                        actual: state.phase.name(),
                    });
                }
            }
            let group = groups.entry(self.entry.group.clone()).or_default();
            let group_free = match &group.active {
                None => true,
                Some(active) => {
                    let done = active.state.lock().expect("effect state").phase
                        == TimedEffectState::Completed;
                    done && group.queue.is_empty()
                }
            };
            if group_free {
                group.active = Some(Arc::clone(&self.entry));
                QueueDecision::StartNow
            } else {
                group.queue.push_back(Arc::clone(&self.entry));
                self.entry.state.lock().expect("effect state").phase = TimedEffectState::Queued;
                QueueDecision::Parked
            }
        };
        match decision {
            QueueDecision::StartNow => self.entry.start().await,
            QueueDecision::Parked => {
                debug!(group = %self.entry.group, id = self.entry.request.id, "effect parked in queue");
                let queued = self
                    .entry
                    .request
                    .response()
                    .result(ResultType::Queue)
                    .build()
                    .expect("QUEUE reply is well-formed");
                self.entry.emit(&queued).await;
            }
        }
        Ok(())
    }

    /// Freeze the clock. Requires a running effect.
    pub async fn pause(&self) -> Result<(), TimedEffectError> {
        let remaining = {
            let mut state = self.entry.state.lock().expect("effect state");
            if state.phase != TimedEffectState::Running {
                return Err(TimedEffectError::IllegalState {
                    op: "pause",
                    actual: state.phase.name(),
                });
            }
            state.phase = TimedEffectState::Paused;
            let elapsed = state
                .started_at
                .take()
                .map_or(Duration::ZERO, |started_at| started_at.elapsed());
            state.remaining = state.remaining.saturating_sub(elapsed);
            state.timer_gen += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.remaining
        };
        let mut builder = self
            .entry
            .request
            .response()
            .result(ResultType::Paused);
        if !remaining.is_zero() {
            builder = builder.time_remaining(remaining);
        }
        let paused = builder.build().expect("PAUSED reply is well-formed");
        self.entry.emit(&paused).await;
        if let Some(callback) = &self.entry.on_pause {
            callback(self);
        }
        Ok(())
    }

    /// Restart the clock with the frozen remainder. Requires a paused effect.
    pub async fn resume(&self) -> Result<(), TimedEffectError> {
        let (remaining, generation) = {
            let mut state = self.entry.state.lock().expect("effect state");
            if state.phase != TimedEffectState::Paused {
                return Err(TimedEffectError::IllegalState {
                    op: "resume",
                    actual: state.phase.name(),
                });
            }
            state.phase = TimedEffectState::Running;
            state.started_at = Some(Instant::now());
            state.timer_gen += 1;
            (state.remaining, state.timer_gen)
        };
        let mut builder = self
            .entry
            .request
            .response()
            .result(ResultType::Resumed);
        if !remaining.is_zero() {
            builder = builder.time_remaining(remaining);
        }
        let resumed = builder.build().expect("RESUMED reply is well-formed");
        self.entry.emit(&resumed).await;
        self.entry.schedule_completion(remaining, generation);
        if let Some(callback) = &self.entry.on_resume {
            callback(self);
        }
        Ok(())
    }

    /// Finish the effect: emit FINISHED, hand the group to the queue head,
    /// run the completion callback. Idempotent; returns whether this call
    /// performed the transition.
    pub async fn complete(&self) -> bool {
        self.entry.complete_now().await
    }
}

impl EffectEntry {
    async fn emit(&self, response: &Response) {
        if let Err(error) = self.request.respond(response).await {
            warn!(
                group = %self.group,
                id = self.request.id,
                error = %error,
                "failed to emit timed effect packet"
            );
        }
    }

    /// Transition to Running and announce it. The start callback's seed is
    /// obtained outside the locks, stamped with SUCCESS and the remaining
    /// duration, and written to the originating connection.
    async fn start(self: &Arc<Self>) {
        let handle = TimedEffect {
            entry: Arc::clone(self),
        };
        let seed = (self.on_start)(&handle);
        let (remaining, generation) = {
            let mut state = self.state.lock().expect("effect state");
            state.phase = TimedEffectState::Running;
            state.started_at = Some(Instant::now());
            state.timer_gen += 1;
            (state.remaining, state.timer_gen)
        };
        debug!(group = %self.group, id = self.request.id, remaining_ms = remaining.as_millis() as u64, "timed effect started");
        let mut builder = seed.id(self.request.id).result(ResultType::Success);
        if !remaining.is_zero() {
            builder = builder.time_remaining(remaining);
        }
        match builder.build() {
            Ok(response) => self.emit(&response).await,
            Err(error) => {
                warn!(group = %self.group, error = %error, "start callback produced an invalid seed");
            }
        }
        self.schedule_completion(remaining, generation);
    }

    fn schedule_completion(self: &Arc<Self>, after: Duration, generation: u64) {
        let entry = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            entry.try_complete(generation).await;
        });
        self.state.lock().expect("effect state").timer = Some(timer);
    }

    /// Timer path into completion: only valid while the incarnation that
    /// scheduled the timer is still running.
    async fn try_complete(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock().expect("effect state");
            if state.phase != TimedEffectState::Running || state.timer_gen != generation {
                return;
            }
            // This task *is* the stored timer; detach the handle so
            // completion does not abort itself mid-emission.
            state.timer = None;
        }
        self.complete_now().await;
    }

    async fn complete_now(self: &Arc<Self>) -> bool {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return false;
        };
        let next = {
            let mut groups = scheduler.groups.lock().expect("scheduler mutex");
            {
                let mut state = self.state.lock().expect("effect state");
                if state.phase == TimedEffectState::Completed {
                    return false;
                }
                state.phase = TimedEffectState::Completed;
                state.started_at = None;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
            let mut next = None;
            if let Some(group) = groups.get_mut(&self.group) {
                if group
                    .active
                    .as_ref()
                    .is_some_and(|active| Arc::ptr_eq(active, self))
                {
                    group.active = None;
                    next = group.queue.pop_front();
                    if let Some(head) = &next {
                        group.active = Some(Arc::clone(head));
                    }
                } else {
                    // Completed straight out of the queue.
                    group.queue.retain(|entry| !Arc::ptr_eq(entry, self));
                }
                if group.active.is_none() && group.queue.is_empty() {
                    groups.remove(&self.group);
                }
            }
            next
        };
        debug!(group = %self.group, id = self.request.id, "timed effect completed");
        let finished = self
            .request
            .response()
            .result(ResultType::Finished)
            .build()
            .expect("FINISHED reply is well-formed");
        self.emit(&finished).await;
        if let Some(head) = next {
            Box::pin(head.start()).await;
        }
        if let Some(callback) = &self.on_complete {
            let handle = TimedEffect {
                entry: Arc::clone(self),
            };
            callback(&handle);
        }
        true
    }
}
