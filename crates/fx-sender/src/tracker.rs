//! Per-request lifecycle tracking on the sender side.
//!
//! The tracker assigns ids, hands requests to the connection's outbox, and
//! turns the wire's interleaved responses into one finite stream per
//! request. It also schedules the locally synthesized packets: RETRY
//! re-sends with exponential backoff and the synthetic FINISHED that ends a
//! timed effect if the peer never says so itself.

use crate::config::SenderOptions;
use crate::error::{SendError, TrackerError};
use fx_protocol::{PacketType, Request, RequestBuilder, Response, ResultType, TriState};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

type SinkItem = Result<Response, TrackerError>;

/// The finite, single-consumer sequence of responses for one request.
///
/// Ends after the terminating response, or after a single terminal error.
/// Locally synthesized responses (re-send RETRYs, synthetic FINISHED) are
/// interleaved in arrival order; the terminating item is always last.
#[derive(Debug)]
pub struct ResponseStream {
    id: u32,
    rx: mpsc::UnboundedReceiver<SinkItem>,
}

impl ResponseStream {
    /// The id the tracker assigned to this request.
    pub fn request_id(&self) -> u32 {
        self.id
    }

    pub async fn next(&mut self) -> Option<SinkItem> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for ResponseStream {
    type Item = SinkItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct EffectData {
    request: Request,
    sink: mpsc::UnboundedSender<SinkItem>,
    response_received: bool,
    retries: u32,
    time_remaining: Option<Duration>,
    updated_at: Instant,
    paused: bool,
    completion_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    timeout_timer: Option<JoinHandle<()>>,
}

impl EffectData {
    fn discard(mut self) {
        for timer in [
            self.completion_timer.take(),
            self.retry_timer.take(),
            self.timeout_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub(crate) struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    outbox: mpsc::UnboundedSender<Request>,
    options: SenderOptions,
    next_id: AtomicU32,
    records: std::sync::Mutex<HashMap<u32, EffectData>>,
    availability: std::sync::Mutex<HashMap<String, TriState>>,
}

impl Tracker {
    pub(crate) fn new(outbox: mpsc::UnboundedSender<Request>, options: SenderOptions) -> Self {
        Tracker {
            inner: Arc::new(TrackerInner {
                outbox,
                options,
                next_id: AtomicU32::new(1),
                records: std::sync::Mutex::new(HashMap::new()),
                availability: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// What the wire has taught us about an effect: the first response ever
    /// seen for it decides, and `Unknown` means nothing has come back yet.
    pub(crate) fn effect_available(&self, effect: &str) -> TriState {
        self.inner
            .availability
            .lock()
            .expect("availability mutex")
            .get(&effect.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Stamp the next id onto `request`, validate it, and hand it to the
    /// connection. The returned stream yields every response for that id.
    pub(crate) fn send(
        &self,
        open: bool,
        request: RequestBuilder,
    ) -> Result<ResponseStream, SendError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = request.id(id).build()?;
        if let Some(effect) = request.effect.as_deref() {
            if self.effect_available(effect) == TriState::False {
                return Err(SendError::EffectUnavailable(effect.to_owned()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = ResponseStream { id, rx };

        if request.kind.is_effect() && !open {
            let _ = tx.send(Err(TrackerError::NotAccepting));
            return Ok(stream);
        }

        let mut data = EffectData {
            request: request.clone(),
            sink: tx,
            response_received: false,
            retries: 0,
            time_remaining: None,
            updated_at: Instant::now(),
            paused: false,
            completion_timer: None,
            retry_timer: None,
            timeout_timer: None,
        };
        if let Some(timeout) = self.inner.options.initial_response_timeout {
            let tracker = self.clone();
            data.timeout_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracker.on_timeout(id);
            }));
        }
        self.inner
            .records
            .lock()
            .expect("records mutex")
            .insert(id, data);

        debug!(id, "request dispatched");
        if self.inner.outbox.send(request).is_err() {
            self.fail(id, TrackerError::Closed);
        }
        Ok(stream)
    }

    /// Route one EFFECT_RESULT from the wire into its per-request record.
    pub(crate) fn handle_response(&self, response: &Response) {
        if response.id == 0 || response.packet != PacketType::EffectResult {
            return;
        }
        let mut records = self.inner.records.lock().expect("records mutex");
        let Some(data) = records.get_mut(&response.id) else {
            debug!(id = response.id, "response for unknown request; dropped");
            return;
        };
        data.response_received = true;
        if let Some(timer) = data.timeout_timer.take() {
            timer.abort();
        }
        if let Some(effect) = data.request.effect.as_deref() {
            self.inner
                .availability
                .lock()
                .expect("availability mutex")
                .entry(effect.to_owned())
                .or_insert_with(|| {
                    TriState::from(response.result != Some(ResultType::Unavailable))
                });
        }

        let _ = data.sink.send(Ok(response.clone()));

        if response.is_terminating() {
            if let Some(data) = records.remove(&response.id) {
                data.discard();
            }
            return;
        }

        match response.result {
            Some(ResultType::Retry) => {
                if data.retries > self.inner.options.max_retries {
                    debug!(id = response.id, "retries exhausted; completing the stream");
                    if let Some(data) = records.remove(&response.id) {
                        data.discard();
                    }
                } else {
                    let delay = Duration::from_secs(1 << (2 + data.retries));
                    data.retries += 1;
                    debug!(id = response.id, delay_s = delay.as_secs(), "re-send scheduled");
                    let tracker = self.clone();
                    let id = response.id;
                    if let Some(old) = data.retry_timer.replace(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        tracker.resend(id);
                    })) {
                        old.abort();
                    }
                }
            }
            Some(ResultType::Paused) => {
                data.paused = true;
                let elapsed = data.updated_at.elapsed();
                data.time_remaining = data.time_remaining.map(|t| t.saturating_sub(elapsed));
                if let Some(timer) = data.completion_timer.take() {
                    timer.abort();
                }
            }
            Some(ResultType::Resumed) => {
                data.paused = false;
                data.updated_at = Instant::now();
                if let Some(remaining) = data.time_remaining {
                    Self::schedule_finish(self, data, response.id, remaining);
                }
            }
            Some(ResultType::Success) => {
                // Terminating SUCCESS was handled above; this one carries
                // timeRemaining and starts a timed effect.
                if let Some(remaining) = response.time_remaining {
                    data.time_remaining = Some(remaining);
                    data.updated_at = Instant::now();
                    data.paused = false;
                    Self::schedule_finish(self, data, response.id, remaining);
                }
            }
            _ => {}
        }
    }

    /// Schedule the synthetic FINISHED; a FINISHED from the peer wins by
    /// removing the record first.
    fn schedule_finish(tracker: &Tracker, data: &mut EffectData, id: u32, after: Duration) {
        let clone = tracker.clone();
        if let Some(old) = data.completion_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            clone.synthesize_finished(id);
        })) {
            old.abort();
        }
    }

    fn synthesize_finished(&self, id: u32) {
        let mut records = self.inner.records.lock().expect("records mutex");
        let Some(data) = records.get_mut(&id) else {
            return;
        };
        if data.paused {
            return;
        }
        let mut builder = Response::builder(PacketType::EffectResult)
            .id(id)
            .result(ResultType::Finished);
        if let Some(effect) = data.request.effect.as_deref() {
            builder = builder.effect(effect);
        }
        let finished = builder.build().expect("synthetic FINISHED is well-formed");
        debug!(id, "synthesizing FINISHED");
        let _ = data.sink.send(Ok(finished));
        // This task *is* the completion timer; drop the handle rather than
        // aborting ourselves mid-send.
        data.completion_timer = None;
        if let Some(data) = records.remove(&id) {
            data.discard();
        }
    }

    fn resend(&self, id: u32) {
        let request = {
            let mut records = self.inner.records.lock().expect("records mutex");
            let Some(data) = records.get_mut(&id) else {
                return;
            };
            data.retry_timer = None;
            data.request.clone()
        };
        debug!(id, "re-sending after RETRY");
        if self.inner.outbox.send(request).is_err() {
            self.fail(id, TrackerError::Closed);
        }
    }

    fn on_timeout(&self, id: u32) {
        let mut records = self.inner.records.lock().expect("records mutex");
        let Some(data) = records.get_mut(&id) else {
            return;
        };
        if data.response_received {
            return;
        }
        warn!(id, "no response within the initial timeout");
        let _ = data.sink.send(Err(TrackerError::Timeout));
        data.timeout_timer = None;
        if let Some(data) = records.remove(&id) {
            data.discard();
        }
    }

    /// Fail one pending request and discard its record.
    pub(crate) fn fail(&self, id: u32, error: TrackerError) {
        let mut records = self.inner.records.lock().expect("records mutex");
        if let Some(data) = records.remove(&id) {
            let _ = data.sink.send(Err(error));
            data.discard();
        }
    }

    /// Fail every pending request immediately (peer is gone).
    pub(crate) fn fail_all(&self, error: TrackerError) {
        let mut records = self.inner.records.lock().expect("records mutex");
        for (_, data) in records.drain() {
            let _ = data.sink.send(Err(error));
            data.discard();
        }
    }

    /// Graceful teardown: in-flight packets may still resolve during the
    /// drain window, then whatever is left fails with `Shutdown`.
    pub(crate) async fn shutdown(&self) {
        tokio::time::sleep(self.inner.options.drain_window).await;
        self.fail_all(TrackerError::Shutdown);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inner.records.lock().expect("records mutex").len()
    }
}
