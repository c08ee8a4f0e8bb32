//! Correlation registry
//!
//! Maps correlation ids to pending calls. Owned by the client task, which is
//! the only writer, so settlement needs no lock: whichever of reply, timeout
//! or teardown reaches the entry first removes it, and every later attempt
//! finds nothing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::messages::CallOutcome;

/// An outstanding request/reply call
#[derive(Debug)]
pub struct PendingCall {
    /// Taken when the call is settled
    reply_tx: Option<oneshot::Sender<CallOutcome>>,
    timer: Option<JoinHandle<()>>,
    task_type: String,
    timeout: Duration,
    issued_at: Instant,
}

impl PendingCall {
    pub fn new(task_type: impl Into<String>, timeout: Duration, reply_tx: oneshot::Sender<CallOutcome>) -> Self {
        Self {
            reply_tx: Some(reply_tx),
            timer: None,
            task_type: task_type.into(),
            timeout,
            issued_at: Instant::now(),
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Correlation id → pending call
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: HashMap<String, PendingCall>,
    settled: u64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call; refuses to replace an id that is already in flight
    pub fn insert(&mut self, correlation_id: String, call: PendingCall) -> Result<(), PendingCall> {
        if self.pending.contains_key(&correlation_id) {
            return Err(call);
        }
        debug!(%correlation_id, task_type = %call.task_type, "CorrelationRegistry::insert");
        self.pending.insert(correlation_id, call);
        Ok(())
    }

    /// Attach the timer task that reports a pending call's expiry
    ///
    /// Returns false (and aborts `timer`) when no such call is pending.
    pub fn arm(&mut self, correlation_id: &str, timer: JoinHandle<()>) -> bool {
        match self.pending.get_mut(correlation_id) {
            Some(call) => {
                call.disarm();
                call.timer = Some(timer);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<&PendingCall> {
        self.pending.get(correlation_id)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Settle a call exactly once
    ///
    /// Removes the entry, cancels its timer and hands `outcome` to the caller.
    /// Returns false when no such call is pending, in which case nothing happens.
    pub fn settle(&mut self, correlation_id: &str, outcome: CallOutcome) -> bool {
        let Some(mut call) = self.pending.remove(correlation_id) else {
            return false;
        };
        call.disarm();
        self.settled += 1;

        let ok = outcome.is_ok();
        let delivered = call.reply_tx.take().is_some_and(|tx| tx.send(outcome).is_ok());
        if !delivered {
            debug!(%correlation_id, ok, "CorrelationRegistry::settle: caller no longer waiting");
        }
        true
    }

    /// Remove a call without settling it (the caller learns of the failure another way)
    pub fn remove(&mut self, correlation_id: &str) -> Option<PendingCall> {
        self.pending.remove(correlation_id)
    }

    /// Settle every pending call with the outcome produced by `outcome`
    pub fn settle_all(&mut self, mut outcome: impl FnMut(&str, &PendingCall) -> CallOutcome) -> usize {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        let mut count = 0;
        for id in ids {
            let result = match self.pending.get(&id) {
                Some(call) => outcome(&id, call),
                None => continue,
            };
            if self.settle(&id, result) {
                count += 1;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Calls settled over the registry's lifetime
    pub fn settled(&self) -> u64 {
        self.settled
    }
}
