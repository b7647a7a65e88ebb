//! Per-stream mutable state: lifecycle phase, inbound deframer, outbound
//! accounting and the request gate.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use grpc_bridge_core::{Deframed, DeframeError, MessageDeframer, Status};

use crate::engine::StreamListener;
use crate::stream::gate::InboundGate;

/// Lifecycle of one RPC stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Bound, no inbound frame yet.
    Created,
    Active,
    /// The client finished sending.
    HalfClosedRemote,
    /// Trailers were written.
    HalfClosedLocal,
    Closed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::Active => "active",
            Phase::HalfClosedRemote => "half-closed (remote)",
            Phase::HalfClosedLocal => "half-closed (local)",
            Phase::Closed => "closed",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

struct Inbound {
    deframer: MessageDeframer,
    /// Set while one caller is handing messages to the listener.
    delivering: bool,
}

/// The engine's listener and the call's final status.
///
/// Kept under one lock so the status is reported exactly once, whether the
/// stream ends before or after the listener is installed.
#[derive(Default)]
struct Completion {
    listener: Option<Arc<dyn StreamListener>>,
    status: Option<Status>,
    reported: bool,
}

impl Completion {
    /// The listener and status to report, if both are known and unreported.
    fn take_report(&mut self) -> Option<(Arc<dyn StreamListener>, Status)> {
        if self.reported {
            return None;
        }
        let report = (self.listener.clone()?, self.status.clone()?);
        self.reported = true;
        Some(report)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct StreamState {
    phase: Mutex<Phase>,
    inbound: Mutex<Inbound>,
    completion: Mutex<Completion>,
    pub(crate) gate: InboundGate,
    outbound_bytes: AtomicU64,
    outbound_messages: AtomicU64,
}

impl StreamState {
    pub(crate) fn new(deframer: MessageDeframer) -> Self {
        Self {
            phase: Mutex::new(Phase::Created),
            inbound: Mutex::new(Inbound {
                deframer,
                delivering: false,
            }),
            completion: Mutex::new(Completion::default()),
            gate: InboundGate::new(),
            outbound_bytes: AtomicU64::new(0),
            outbound_messages: AtomicU64::new(0),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// First inbound frame: `Created` becomes `Active`.
    pub(crate) fn activate(&self) {
        let mut phase = lock(&self.phase);
        if *phase == Phase::Created {
            *phase = Phase::Active;
        }
    }

    /// Record one side finishing. Returns true if the stream is now `Closed`.
    pub(crate) fn half_close(&self, local: bool) -> bool {
        let mut phase = lock(&self.phase);
        *phase = match (*phase, local) {
            (Phase::Created | Phase::Active, true) => Phase::HalfClosedLocal,
            (Phase::Created | Phase::Active, false) => Phase::HalfClosedRemote,
            (Phase::HalfClosedRemote, true) | (Phase::HalfClosedLocal, false) => Phase::Closed,
            (current, _) => current,
        };
        *phase == Phase::Closed
    }

    /// Move to `Closed` unless already terminal. Returns true on the transition.
    pub(crate) fn close(&self) -> bool {
        self.finish(Phase::Closed)
    }

    /// Move to `Cancelled` unless already terminal. Returns true on the transition.
    pub(crate) fn cancel(&self) -> bool {
        self.finish(Phase::Cancelled)
    }

    fn finish(&self, to: Phase) -> bool {
        let mut phase = lock(&self.phase);
        if phase.is_terminal() {
            return false;
        }
        *phase = to;
        true
    }

    /// Record the final status; the first one recorded wins.
    ///
    /// Returns the listener to notify when one is installed. Otherwise the
    /// status waits for [`set_listener`](Self::set_listener).
    pub(crate) fn record_close(&self, status: &Status) -> Option<(Arc<dyn StreamListener>, Status)> {
        let mut completion = lock(&self.completion);
        if completion.status.is_none() {
            completion.status = Some(status.clone());
        }
        completion.take_report()
    }

    /// Install the listener. Returns the final status to report to it when
    /// the stream already ended.
    pub(crate) fn set_listener(
        &self,
        listener: Arc<dyn StreamListener>,
    ) -> Option<(Arc<dyn StreamListener>, Status)> {
        let mut completion = lock(&self.completion);
        completion.listener = Some(listener);
        completion.take_report()
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn StreamListener>> {
        lock(&self.completion).listener.clone()
    }

    pub(crate) fn record_outbound(&self, bytes: usize, messages: u32) {
        self.outbound_bytes.fetch_add(bytes as u64, Ordering::AcqRel);
        self.outbound_messages
            .fetch_add(u64::from(messages), Ordering::AcqRel);
    }

    pub(crate) fn outbound_bytes(&self) -> u64 {
        self.outbound_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn outbound_messages(&self) -> u64 {
        self.outbound_messages.load(Ordering::Acquire)
    }

    /// Run `f` against the deframer under the inbound lock.
    pub(crate) fn with_deframer<R>(&self, f: impl FnOnce(&mut MessageDeframer) -> R) -> R {
        f(&mut lock(&self.inbound).deframer)
    }

    /// Hand every releasable message to the listener.
    ///
    /// Messages are drained under the inbound lock and delivered outside it.
    /// A caller arriving while another delivery is running returns at once;
    /// the running loop drains again before it stops, so nothing is missed
    /// and a listener calling back into the stream cannot deadlock.
    ///
    /// Returns true when delivering the client's half-close closed the stream.
    pub(crate) fn deliver(&self) -> Result<bool, DeframeError> {
        let Some(listener) = self.listener() else {
            return Ok(false);
        };
        {
            let mut inbound = lock(&self.inbound);
            if inbound.delivering {
                return Ok(false);
            }
            inbound.delivering = true;
        }

        let mut closed = false;
        loop {
            let batch = {
                let mut inbound = lock(&self.inbound);
                let drained = if self.is_terminal() {
                    Ok(Vec::new())
                } else {
                    inbound.deframer.drain()
                };
                match drained {
                    Ok(batch) if !batch.is_empty() => batch,
                    other => {
                        inbound.delivering = false;
                        return other.map(|_| closed);
                    }
                }
            };

            for item in batch {
                match item {
                    Deframed::Message(message) => listener.message_available(message),
                    Deframed::EndOfStream => {
                        listener.half_closed();
                        closed |= self.half_close(false);
                    }
                }
            }
        }
    }
}
