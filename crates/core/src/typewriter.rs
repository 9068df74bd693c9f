//! Typewriter: fixed-rate reveal of progressively arriving text.
//!
//! The producer (a network stream, or a reply that arrived all at once)
//! appends into a [`RevealBuffer`]; [`StreamTypewriter::animate`] reveals it a
//! few characters per tick so bursts of tokens never appear as a sudden jump.
//! Data arrival and display are fully decoupled:
//!
//! - the animator never shows characters that have not arrived yet,
//! - it idles (but keeps ticking) when it catches up with an open buffer,
//! - it finishes only once the buffer is closed and fully shown,
//! - on cancellation it stops and snaps the display to everything received.

use crate::transcript::MessageId;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where revealed text goes. Each call carries the full displayed text.
#[async_trait]
pub trait RevealSink: Send {
    async fn reveal(&mut self, id: MessageId, displayed: &str);
}

#[derive(Debug, Default)]
struct BufferState {
    text: String,
    closed: bool,
}

/// A growing text payload shared between a producer and the animator.
///
/// Clones share the same underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct RevealBuffer {
    inner: Arc<Mutex<BufferState>>,
}

/// What the next tick should do.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Advance { shown: usize, text: String },
    Idle,
    Finished,
}

impl RevealBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that already holds its final text.
    pub fn complete(text: impl Into<String>) -> Self {
        let buffer = Self::new();
        {
            let mut state = buffer.lock();
            state.text = text.into();
            state.closed = true;
        }
        buffer
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a fragment. Fragments pushed after [`close`](Self::close) are dropped.
    pub fn push(&self, fragment: &str) {
        let mut state = self.lock();
        if !state.closed {
            state.text.push_str(fragment);
        }
    }

    /// Signals that no more text will arrive.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Buffered length in bytes.
    pub fn len(&self) -> usize {
        self.lock().text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().text.is_empty()
    }

    /// Everything received so far.
    pub fn text(&self) -> String {
        self.lock().text.clone()
    }

    /// Advances past up to `units` characters starting at byte offset `shown`.
    fn next_frame(&self, shown: usize, units: usize) -> Frame {
        let state = self.lock();
        if shown < state.text.len() {
            let rest = &state.text[shown..];
            let step = rest
                .char_indices()
                .nth(units)
                .map_or(rest.len(), |(offset, _)| offset);
            let shown = shown + step;
            Frame::Advance {
                shown,
                text: state.text[..shown].to_string(),
            }
        } else if state.closed {
            Frame::Finished
        } else {
            Frame::Idle
        }
    }
}

/// Speed of the reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealRate {
    pub tick: Duration,
    pub chars_per_tick: usize,
}

impl RevealRate {
    /// Default pace of the two-persona playground.
    pub const PLAYGROUND: RevealRate = RevealRate {
        tick: Duration::from_millis(8),
        chars_per_tick: 1,
    };
    /// Default pace of the single-persona chat.
    pub const CHAT: RevealRate = RevealRate {
        tick: Duration::from_millis(13),
        chars_per_tick: 1,
    };

    pub fn new(tick: Duration, chars_per_tick: usize) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
            chars_per_tick: chars_per_tick.max(1),
        }
    }
}

impl Default for RevealRate {
    fn default() -> Self {
        Self::PLAYGROUND
    }
}

/// How an animation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationOutcome {
    /// The buffer closed and everything was revealed.
    Completed,
    /// Cancelled or preempted; the display was snapped to the buffered text.
    Cancelled,
}

#[derive(Debug)]
struct ActiveAnimation {
    id: MessageId,
    cancel: CancellationToken,
}

/// Reveals text at a fixed rate.
///
/// Clones share a single active-animation slot: starting an animation stops
/// whichever one is running on any clone. Give each independent transcript its
/// own typewriter if they must animate at the same time.
#[derive(Debug, Clone, Default)]
pub struct StreamTypewriter {
    rate: RevealRate,
    active: Arc<Mutex<Option<ActiveAnimation>>>,
}

impl StreamTypewriter {
    pub fn new(rate: RevealRate) -> Self {
        Self {
            rate,
            active: Arc::default(),
        }
    }

    /// The message currently being typed, if any.
    pub fn typing(&self) -> Option<MessageId> {
        self.slot().as_ref().map(|a| a.id)
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveAnimation>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, id: MessageId, cancel: CancellationToken) {
        let previous = self.slot().replace(ActiveAnimation { id, cancel });
        if let Some(previous) = previous {
            debug!(previous = %previous.id, next = %id, "Preempting running animation");
            previous.cancel.cancel();
        }
    }

    fn release(&self, id: MessageId) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|a| a.id == id) {
            *slot = None;
        }
    }

    /// Stops the running animation, if any. It snaps to its buffered text.
    pub fn stop(&self) {
        if let Some(active) = self.slot().take() {
            active.cancel.cancel();
        }
    }

    /// Reveals `buffer` into `sink` under message `id`.
    ///
    /// Resolves once the buffer is closed and fully shown, or as soon as
    /// `cancel` fires. On cancellation exactly one final write sets the display
    /// to the full buffered text.
    pub async fn animate<S>(
        &self,
        id: MessageId,
        buffer: &RevealBuffer,
        cancel: &CancellationToken,
        sink: &mut S,
    ) -> AnimationOutcome
    where
        S: RevealSink + ?Sized,
    {
        let local = cancel.child_token();
        self.install(id, local.clone());

        let mut ticker = interval(self.rate.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shown = 0;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = local.cancelled() => {
                    sink.reveal(id, &buffer.text()).await;
                    break AnimationOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            match buffer.next_frame(shown, self.rate.chars_per_tick) {
                Frame::Advance { shown: next, text } => {
                    shown = next;
                    sink.reveal(id, &text).await;
                }
                Frame::Idle => {}
                Frame::Finished => break AnimationOutcome::Completed,
            }
        };

        self.release(id);
        debug!(%id, ?outcome, revealed = shown, "Animation finished");
        outcome
    }
}
