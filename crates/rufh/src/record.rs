//! Per-upload state machine.
//!
//! An [`UploadRecord`] is shared by every HTTP transaction that touches the
//! same upload token and by the one downstream relay task reading the
//! concatenated body. The committed offset counts only bytes the downstream
//! side has actually pulled from the buffer; a producing transaction that
//! dies mid-transfer takes its buffered-but-undrained suffix with it, so the
//! offset reported to clients is always a truthful resumption point.

use std::collections::VecDeque;
use std::io::Error as IoError;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use salvo_core::Response;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{ProtocolError, RufhError};
use crate::fields::UploadToken;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum UploadPhase {
    /// A producing transaction is attached and bytes are being admitted.
    Receiving,
    /// No producer attached; the upload is waiting for its next append.
    Idle,
    /// All body bytes are in; the downstream side may still be draining.
    Complete,
    /// Cancelled, evicted or concluded by the downstream handler; dead end.
    Terminated,
}

/// Fields of a creation request that persist on the record.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CreateParams {
    pub(crate) total_length: Option<u64>,
    pub(crate) interop_version: Option<i64>,
}

/// Preconditions an appending request must satisfy at admission time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AppendParams {
    pub(crate) offset: u64,
    pub(crate) total_length: Option<u64>,
    pub(crate) interop_version: Option<i64>,
}

/// Point-in-time view served to offset-retrieval requests.
#[derive(Clone, Copy, Debug)]
pub(crate) struct UploadStatus {
    pub(crate) offset: u64,
    pub(crate) total_length: Option<u64>,
    pub(crate) interop_version: Option<i64>,
    pub(crate) complete: bool,
    pub(crate) terminated: bool,
}

/// How a clean `Upload-Incomplete: ?1` close resolved.
#[derive(Debug)]
pub(crate) enum ParkOutcome {
    /// Buffer drained; the record is idle at the reported offset.
    Parked { offset: u64 },
    /// The declared length was reached, which completes the upload.
    Completed { offset: u64 },
    /// The record was terminated while waiting for the drain.
    Terminated,
}

#[derive(Debug)]
struct RecordState {
    phase: UploadPhase,
    /// Bytes the downstream side has pulled from the buffer. Invariantly
    /// monotone and never ahead of what the consumer acknowledged.
    offset: u64,
    /// Cumulative bytes admitted from producers; rewound to `offset` when a
    /// producer aborts and its buffered suffix is discarded.
    admitted: u64,
    total_length: Option<u64>,
    interop_version: Option<i64>,
    buffer: VecDeque<Bytes>,
    buffered: usize,
    /// No further producer bytes will ever arrive; the consumer sees EOF.
    eof: bool,
    producer: bool,
    producer_epoch: u64,
    reader: Option<Waker>,
    /// Parked response of the downstream handler, delivered to the attached
    /// producer or to the next transaction that asks.
    response: Option<Response>,
    finished: bool,
    last_activity: Instant,
}

#[derive(Debug)]
pub(crate) struct UploadRecord {
    token: UploadToken,
    buffer_limit: usize,
    state: Mutex<RecordState>,
    /// Bumped on every state change; async waiters subscribe and re-check.
    pulse: watch::Sender<u64>,
}

impl UploadRecord {
    /// Create a record with the creating transaction already occupying the
    /// producer slot, so no half-initialized record is ever observable.
    pub(crate) fn new_attached(
        token: UploadToken,
        params: CreateParams,
        buffer_limit: usize,
    ) -> (Arc<Self>, ProducerGuard) {
        let (pulse, _) = watch::channel(0u64);
        let record = Arc::new(Self {
            token,
            buffer_limit,
            state: Mutex::new(RecordState {
                phase: UploadPhase::Receiving,
                offset: 0,
                admitted: 0,
                total_length: params.total_length,
                interop_version: params.interop_version,
                buffer: VecDeque::new(),
                buffered: 0,
                eof: false,
                producer: true,
                producer_epoch: 1,
                reader: None,
                response: None,
                finished: false,
                last_activity: Instant::now(),
            }),
            pulse,
        });
        let guard = ProducerGuard {
            record: record.clone(),
            epoch: 1,
            armed: true,
        };
        (record, guard)
    }

    pub(crate) fn token(&self) -> &UploadToken {
        &self.token
    }

    /// Admit an appending transaction into the producer slot.
    ///
    /// Checks run in precedence order: record liveness, interop version,
    /// offset, declared length. Exactly one of two transactions racing for
    /// the slot wins; the loser observes a conflict.
    pub(crate) fn attach(
        self: &Arc<Self>,
        params: &AppendParams,
    ) -> Result<ProducerGuard, RufhError> {
        let mut state = self.state.lock();
        match state.phase {
            UploadPhase::Terminated => return Err(RufhError::Terminated),
            UploadPhase::Complete => return Err(RufhError::Concluded),
            UploadPhase::Receiving => return Err(RufhError::ProducerBusy),
            UploadPhase::Idle => {}
        }
        if params.interop_version != state.interop_version {
            return Err(ProtocolError::InteropMismatch.into());
        }
        if params.offset != state.offset {
            return Err(RufhError::OffsetMismatch {
                expected: state.offset,
                got: params.offset,
            });
        }
        if let Some(declared) = params.total_length {
            match state.total_length {
                Some(known) if known != declared => {
                    return Err(ProtocolError::LengthConflict.into());
                }
                Some(_) => {}
                None => state.total_length = Some(declared),
            }
        }
        state.phase = UploadPhase::Receiving;
        state.producer = true;
        state.producer_epoch += 1;
        state.last_activity = Instant::now();
        let epoch = state.producer_epoch;
        drop(state);
        self.pulse.send_modify(|v| *v += 1);
        Ok(ProducerGuard {
            record: self.clone(),
            epoch,
            armed: true,
        })
    }

    pub(crate) fn status(&self) -> UploadStatus {
        let state = self.state.lock();
        UploadStatus {
            offset: state.offset,
            total_length: state.total_length,
            interop_version: state.interop_version,
            complete: state.phase == UploadPhase::Complete,
            terminated: state.phase == UploadPhase::Terminated,
        }
    }

    pub(crate) fn interop_version(&self) -> Option<i64> {
        self.state.lock().interop_version
    }

    /// Cancel the upload: drop buffered bytes, discard any parked response
    /// and fail the downstream body stream.
    pub(crate) fn terminate(&self) {
        let mut state = self.state.lock();
        if state.phase == UploadPhase::Terminated && state.response.is_none() {
            return;
        }
        state.phase = UploadPhase::Terminated;
        state.buffer.clear();
        state.buffered = 0;
        state.admitted = state.offset;
        state.response = None;
        state.last_activity = Instant::now();
        if let Some(waker) = state.reader.take() {
            waker.wake();
        }
        drop(state);
        self.pulse.send_modify(|v| *v += 1);
    }

    /// Called by the relay task when the downstream handler returns. A
    /// handler that concludes before the upload completed kills the record;
    /// its response is parked either way, unless the record was already
    /// cancelled (then the response is discarded).
    pub(crate) fn downstream_finished(&self, response: Response) {
        let mut state = self.state.lock();
        state.finished = true;
        if state.phase != UploadPhase::Terminated {
            if state.phase != UploadPhase::Complete {
                tracing::debug!(token = %self.token.to_segment(), "downstream handler concluded before upload completion");
                state.phase = UploadPhase::Terminated;
                state.buffer.clear();
                state.buffered = 0;
                state.admitted = state.offset;
            }
            state.response = Some(response);
        }
        state.last_activity = Instant::now();
        if let Some(waker) = state.reader.take() {
            waker.wake();
        }
        drop(state);
        self.pulse.send_modify(|v| *v += 1);
    }

    /// Take the parked downstream response, if one is waiting.
    pub(crate) fn take_response(&self) -> Option<Response> {
        let mut state = self.state.lock();
        let response = state.response.take();
        if response.is_some() {
            state.last_activity = Instant::now();
            drop(state);
            self.pulse.send_modify(|v| *v += 1);
        }
        response
    }

    /// Wait until the downstream handler has returned and claim its
    /// response. `None` means the response was discarded (cancel) or already
    /// delivered elsewhere.
    pub(crate) async fn await_response(&self) -> Option<Response> {
        loop {
            let mut rx = self.pulse.subscribe();
            {
                let mut state = self.state.lock();
                if let Some(response) = state.response.take() {
                    drop(state);
                    self.pulse.send_modify(|v| *v += 1);
                    return Some(response);
                }
                if state.finished || state.phase == UploadPhase::Terminated {
                    return None;
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Wait (bounded) until the downstream side has drained everything
    /// admitted so far, returning the committed offset.
    pub(crate) async fn await_drained(&self, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        loop {
            let mut rx = self.pulse.subscribe();
            {
                let state = self.state.lock();
                if state.buffer.is_empty() || state.phase == UploadPhase::Terminated {
                    return state.offset;
                }
            }
            if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                return self.state.lock().offset;
            }
        }
    }

    /// Eviction test used by the registry sweeper. Receiving records are
    /// never reaped here; the transfer-inactivity timeout covers those.
    pub(crate) fn expired(&self, idle: Duration) -> bool {
        let state = self.state.lock();
        state.phase != UploadPhase::Receiving && state.last_activity.elapsed() >= idle
    }

    /// Consumer-side pull, driven by the relay body's `poll_frame`. Popping
    /// a chunk is the moment its bytes count as committed.
    pub(crate) fn poll_pull(&self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IoError>>> {
        let mut state = self.state.lock();
        if let Some(chunk) = state.buffer.pop_front() {
            state.buffered -= chunk.len();
            state.offset += chunk.len() as u64;
            state.last_activity = Instant::now();
            drop(state);
            self.pulse.send_modify(|v| *v += 1);
            return Poll::Ready(Some(Ok(chunk)));
        }
        if state.phase == UploadPhase::Terminated {
            return Poll::Ready(Some(Err(IoError::other("upload terminated"))));
        }
        if state.eof {
            return Poll::Ready(None);
        }
        state.reader = Some(cx.waker().clone());
        Poll::Pending
    }

    fn abort_producer(&self, epoch: u64) {
        let mut state = self.state.lock();
        if !state.producer || state.producer_epoch != epoch || state.phase != UploadPhase::Receiving
        {
            return;
        }
        // Transport failure: the undrained suffix is gone; the committed
        // offset stays at what the downstream side actually consumed.
        let dropped = state.buffered;
        state.buffer.clear();
        state.buffered = 0;
        state.admitted = state.offset;
        state.producer = false;
        state.phase = UploadPhase::Idle;
        state.last_activity = Instant::now();
        drop(state);
        if dropped > 0 {
            tracing::debug!(
                token = %self.token.to_segment(),
                dropped,
                "producer aborted; discarding undrained bytes"
            );
        }
        self.pulse.send_modify(|v| *v += 1);
    }
}

/// Exclusive hold on a record's producer slot.
///
/// Dropping the guard without a clean finish is the transport-failure path:
/// the record returns to idle at the committed offset.
#[derive(Debug)]
pub(crate) struct ProducerGuard {
    record: Arc<UploadRecord>,
    epoch: u64,
    armed: bool,
}

impl ProducerGuard {
    pub(crate) fn record(&self) -> &Arc<UploadRecord> {
        &self.record
    }

    /// Admit one chunk, waiting while the buffer sits at its high-water
    /// mark. Admission fails once the record is terminated.
    pub(crate) async fn push(&mut self, data: Bytes) -> Result<(), RufhError> {
        if data.is_empty() {
            return Ok(());
        }
        loop {
            let mut rx = self.record.pulse.subscribe();
            {
                let mut state = self.record.state.lock();
                if state.phase == UploadPhase::Terminated {
                    return Err(RufhError::Terminated);
                }
                if let Some(total) = state.total_length {
                    if state.admitted + data.len() as u64 > total {
                        return Err(ProtocolError::LengthExceeded.into());
                    }
                }
                if state.buffered < self.record.buffer_limit {
                    state.buffered += data.len();
                    state.admitted += data.len() as u64;
                    state.buffer.push_back(data);
                    state.last_activity = Instant::now();
                    if let Some(waker) = state.reader.take() {
                        waker.wake();
                    }
                    drop(state);
                    self.record.pulse.send_modify(|v| *v += 1);
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Err(RufhError::Terminated);
            }
        }
    }

    /// Clean close with more bytes to follow. Waits (bounded) for the
    /// downstream side to drain what was admitted, then parks the record
    /// idle; anything still undrained at the deadline is discarded so the
    /// reported offset stays truthful.
    // The guard stays armed through the drain wait: a transaction cancelled
    // here is a transport failure and must fall back to the abort path. The
    // drop hook is a no-op once the transition below has run.
    pub(crate) async fn park(self, drain_timeout: Duration) -> ParkOutcome {
        let deadline = Instant::now() + drain_timeout;
        loop {
            let mut rx = self.record.pulse.subscribe();
            {
                let mut state = self.record.state.lock();
                if state.phase == UploadPhase::Terminated {
                    return ParkOutcome::Terminated;
                }
                if state.buffer.is_empty() {
                    if state.total_length == Some(state.offset) {
                        state.phase = UploadPhase::Complete;
                        state.eof = true;
                        state.producer = false;
                        state.last_activity = Instant::now();
                        let offset = state.offset;
                        if let Some(waker) = state.reader.take() {
                            waker.wake();
                        }
                        drop(state);
                        self.record.pulse.send_modify(|v| *v += 1);
                        return ParkOutcome::Completed { offset };
                    }
                    state.phase = UploadPhase::Idle;
                    state.producer = false;
                    state.last_activity = Instant::now();
                    let offset = state.offset;
                    drop(state);
                    self.record.pulse.send_modify(|v| *v += 1);
                    return ParkOutcome::Parked { offset };
                }
            }
            if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                // The handler stopped draining; keep only what it consumed.
                self.record.abort_producer_buffer_only();
            }
        }
    }

    /// A transaction claiming to complete the upload must have landed
    /// exactly on the declared length, when one exists.
    pub(crate) fn unmet_length(&self) -> Option<RufhError> {
        let state = self.record.state.lock();
        match state.total_length {
            Some(total) if state.admitted < total => Some(ProtocolError::ShortBody.into()),
            _ => None,
        }
    }

    /// Clean close of the final transaction: all bytes are in, the
    /// downstream body reaches EOF once the buffer drains.
    pub(crate) fn complete(mut self) {
        self.armed = false;
        let record = self.record.clone();
        let mut state = record.state.lock();
        if state.phase != UploadPhase::Receiving {
            return;
        }
        state.phase = UploadPhase::Complete;
        state.eof = true;
        state.producer = false;
        state.last_activity = Instant::now();
        if let Some(waker) = state.reader.take() {
            waker.wake();
        }
        drop(state);
        record.pulse.send_modify(|v| *v += 1);
    }
}

impl UploadRecord {
    /// Drop buffered bytes of a still-attached producer without detaching
    /// it. Used when a drain deadline expires during park.
    fn abort_producer_buffer_only(&self) {
        let mut state = self.state.lock();
        if state.phase != UploadPhase::Receiving {
            return;
        }
        state.buffer.clear();
        state.buffered = 0;
        state.admitted = state.offset;
        drop(state);
        self.pulse.send_modify(|v| *v += 1);
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if self.armed {
            self.record.abort_producer(self.epoch);
        }
    }
}
