//! Streaming response accumulation.
//!
//! [`ResponseAccumulator`] consumes the [`FragmentEvent`] channel a backend
//! stream writes into and yields a display-ready snapshot per fragment. It
//! also tracks how long the model has been in a reasoning block so the UI
//! can show "thought for N seconds".
//!
//! The accumulator takes timestamps from a caller-supplied clock, so tests
//! control time.

use std::time::{Duration, Instant};

use atelier_types::{ContentPart, FragmentEvent, RawFragment, merge_all, merge_fragment};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One display-ready view of the accumulated response.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub parts: Vec<ContentPart>,
    /// Seconds spent reasoning so far; `None` until the first reasoning part.
    pub reasoning_seconds: Option<f64>,
}

/// What the accumulator yields per turn of its state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    Snapshot(Snapshot),
    /// The stream reported an error. Parts accumulated before the error are
    /// carried so the caller can decide whether to keep them.
    Failed {
        message: String,
        partial: Vec<ContentPart>,
    },
}

/// Completed response from the non-streaming path.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResponse {
    pub parts: Vec<ContentPart>,
    pub reasoning_seconds: Option<f64>,
}

/// State machine folding fragments into parts.
///
/// `next` returns `None` when the stream is exhausted or cancellation was
/// observed; cancellation discards state without error. Reported reasoning
/// duration never decreases.
pub struct ResponseAccumulator<C = fn() -> Instant>
where
    C: FnMut() -> Instant,
{
    rx: mpsc::Receiver<FragmentEvent>,
    cancel: CancellationToken,
    clock: C,
    parts: Vec<ContentPart>,
    reasoning_started_at: Option<Instant>,
    reasoning_seconds: Option<f64>,
    finished: bool,
}

impl ResponseAccumulator {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<FragmentEvent>, cancel: CancellationToken) -> Self {
        Self::with_clock(rx, cancel, Instant::now)
    }
}

impl<C> ResponseAccumulator<C>
where
    C: FnMut() -> Instant,
{
    #[must_use]
    pub fn with_clock(rx: mpsc::Receiver<FragmentEvent>, cancel: CancellationToken, clock: C) -> Self {
        Self {
            rx,
            cancel,
            clock,
            parts: Vec::new(),
            reasoning_started_at: None,
            reasoning_seconds: None,
            finished: false,
        }
    }

    /// Advance the state machine by one event.
    ///
    /// Cancellation is checked at every fragment boundary; once observed,
    /// this returns `None` and no further snapshots are produced.
    pub async fn next(&mut self) -> Option<StreamStep> {
        if self.finished {
            return None;
        }

        let event = tokio::select! {
            () = self.cancel.cancelled() => {
                self.finished = true;
                return None;
            }
            event = self.rx.recv() => event,
        };

        match event {
            Some(FragmentEvent::Fragment(fragment)) => {
                merge_fragment(&mut self.parts, fragment);
                self.update_reasoning_clock();
                Some(StreamStep::Snapshot(self.snapshot()))
            }
            Some(FragmentEvent::Error(message)) => {
                self.finished = true;
                Some(StreamStep::Failed {
                    message,
                    partial: self.parts.clone(),
                })
            }
            // Done, or the channel closing without one.
            Some(FragmentEvent::Done) | None => {
                self.finished = true;
                self.corrective_final_snapshot()
            }
        }
    }

    /// Parts accumulated so far.
    #[must_use]
    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    /// Consume the accumulator into its final state.
    #[must_use]
    pub fn into_final(self) -> FinalResponse {
        FinalResponse {
            parts: self.parts,
            reasoning_seconds: self.reasoning_seconds,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            parts: self.parts.clone(),
            reasoning_seconds: self.reasoning_seconds,
        }
    }

    fn update_reasoning_clock(&mut self) {
        let reasoning_now = self.parts.last().is_some_and(ContentPart::is_reasoning);
        if reasoning_now {
            let now = (self.clock)();
            let started = *self.reasoning_started_at.get_or_insert(now);
            self.record_duration(now.saturating_duration_since(started));
        } else {
            // Leaving reasoning retains the last measured duration.
            self.reasoning_started_at = None;
        }
    }

    /// The per-fragment duration undershoots at end of stream: the last
    /// refresh happened at the last fragment, not at completion. If the
    /// stream ends while still reasoning, emit one corrected snapshot
    /// measured now.
    fn corrective_final_snapshot(&mut self) -> Option<StreamStep> {
        let started = self.reasoning_started_at.take()?;
        let now = (self.clock)();
        self.record_duration(now.saturating_duration_since(started));
        Some(StreamStep::Snapshot(self.snapshot()))
    }

    fn record_duration(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.reasoning_seconds = Some(self.reasoning_seconds.map_or(secs, |prev| prev.max(secs)));
    }
}

/// Fold a complete (non-streaming) response.
///
/// The duration here is coarse by design: the whole call's wall-clock time
/// is attributed to reasoning iff any part is reasoning-typed. The streaming
/// path measures actual reasoning spans instead; the two are not unified.
#[must_use]
pub fn accumulate_complete(
    fragments: Vec<RawFragment>,
    call_elapsed: Duration,
) -> FinalResponse {
    let parts = merge_all(fragments);
    let reasoning_seconds = parts
        .iter()
        .any(ContentPart::is_reasoning)
        .then(|| call_elapsed.as_secs_f64());
    FinalResponse {
        parts,
        reasoning_seconds,
    }
}
