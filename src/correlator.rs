//! Request/response correlation: sequence numbers and a pending-futures map.
//!
//! Each request carries a monotonic `seq_num`; a reply names it as
//! `response_to` so the waiting caller can be resolved from a background
//! notification loop via a `tokio::sync::oneshot` channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::codec::DecodedMessage;
use crate::error::Error;
use crate::opcode;

/// Default timeout waiting for a correlated response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Assigns monotonic `seq_num`s and routes replies back to waiting callers.
pub struct Correlator {
    next_seq: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<DecodedMessage, Error>>>>,
    timeout: Duration,
}

impl Correlator {
    pub fn new() -> Self {
        Correlator::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Correlator {
            next_seq: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// `seq_num`s start at 1 on every successful connect.
    pub fn reset_seq_num(&self) {
        self.next_seq.store(1, Ordering::SeqCst);
    }

    pub fn next_seq_num(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register `seq_num` as awaiting a reply and return a receiver. Call
    /// this before the request is actually written to the transport, to
    /// avoid a race against an unexpectedly fast reply.
    pub async fn register(&self, seq_num: u32) -> oneshot::Receiver<Result<DecodedMessage, Error>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq_num, tx);
        rx
    }

    /// Route an inbound message to its waiter, if any. Device-originated
    /// opcodes (>= 0x8000) never resolve pending futures.
    pub async fn dispatch(&self, message: DecodedMessage) {
        if opcode::is_device_originated(message.opcode) {
            return;
        }
        if let Some(tx) = self.pending.lock().await.remove(&message.response_to) {
            let _ = tx.send(Ok(message));
        }
    }

    /// Await a previously `register`ed reply, applying the configured
    /// timeout.
    pub async fn wait(
        &self,
        seq_num: u32,
        rx: oneshot::Receiver<Result<DecodedMessage, Error>>,
    ) -> Result<DecodedMessage, Error> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Timeout),
            Err(_) => {
                self.pending.lock().await.remove(&seq_num);
                Err(Error::Timeout)
            }
        }
    }

    /// Cancel every pending waiter, e.g. on disconnect, resolving each with
    /// an error rather than leaving it to time out.
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::Transport(Box::from("connection reset"))));
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{DEVICE_STATUS, RECEIVE_DP};

    fn message(response_to: u32, opcode: u16) -> DecodedMessage {
        DecodedMessage {
            seq_num: 99,
            response_to,
            opcode,
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn seq_num_is_monotonic_and_resettable() {
        let correlator = Correlator::new();
        assert_eq!(correlator.next_seq_num(), 1);
        assert_eq!(correlator.next_seq_num(), 2);
        correlator.reset_seq_num();
        assert_eq!(correlator.next_seq_num(), 1);
    }

    #[tokio::test]
    async fn dispatch_resolves_matching_waiter() {
        let correlator = Correlator::new();
        let seq = correlator.next_seq_num();
        let rx = correlator.register(seq).await;
        correlator.dispatch(message(seq, DEVICE_STATUS)).await;
        let result = correlator.wait(seq, rx).await.unwrap();
        assert_eq!(result.response_to, seq);
    }

    #[tokio::test]
    async fn device_originated_opcode_never_resolves_a_waiter() {
        let correlator = Correlator::new();
        let seq = correlator.next_seq_num();
        let rx = correlator.register(seq).await;
        correlator.dispatch(message(seq, RECEIVE_DP)).await;

        let result = tokio::time::timeout(Duration::from_millis(50), rx).await;
        assert!(result.is_err(), "receiver should still be pending");
    }

    #[tokio::test]
    async fn cancel_all_resolves_pending_waiters_with_error() {
        let correlator = Correlator::new();
        let seq = correlator.next_seq_num();
        let rx = correlator.register(seq).await;
        correlator.cancel_all().await;
        assert!(correlator.wait(seq, rx).await.is_err());
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_resolves_it() {
        crate::init_test_logging();
        let correlator = Correlator::with_timeout(Duration::from_millis(20));
        let seq = correlator.next_seq_num();
        let rx = correlator.register(seq).await;
        let result = correlator.wait(seq, rx).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
