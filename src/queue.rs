// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of gelf-tracing.
//
// gelf-tracing is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// gelf-tracing is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with gelf-tracing.  If
// not, see <http://www.gnu.org/licenses/>.
//! The delivery queue.
//!
//! Producers hand encoded payloads to a [`DeliveryQueue`]; a single consumer thread, owned by
//! a [`Worker`], pulls them off in FIFO order & drives the [`Transport`]. The producer side
//! never touches the network: under [`OverflowPolicy::DropNewest`] a full queue costs the
//! caller one failed `try_send`, under [`OverflowPolicy::Block`] at most the configured timeout.
//!
//! While a stream transport is down, payloads it refuses are either dropped (the default) or
//! parked in a bounded retry buffer & re-sent, in order, once the connection comes back. Either
//! way memory use is bounded.

use crate::{
    error::{Error, Result},
    stats::{add, bump, Stats},
    transport::Transport,
};

use crossbeam::channel::{
    after, bounded, never, select, Receiver, SendTimeoutError, Sender, TrySendError,
};
use tracing::{debug, error, info, warn};

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What [`DeliveryQueue::submit`] does when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new payload immediately
    #[default]
    DropNewest,
    /// Wait up to this long for room, then refuse the new payload
    Block(Duration),
}

/// Sizing & policy for the queue & its consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub(crate) capacity: usize,
    pub(crate) overflow: OverflowPolicy,
    pub(crate) retry_capacity: usize,
    pub(crate) grace: Duration,
}

impl std::default::Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropNewest,
            retry_capacity: 0,
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl QueueSettings {
    pub fn new() -> QueueSettings {
        QueueSettings::default()
    }
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
    /// Number of refused payloads to hold for re-sending; zero disables the retry buffer
    pub fn retry_capacity(mut self, retry_capacity: usize) -> Self {
        self.retry_capacity = retry_capacity;
        self
    }
    /// How long shutdown may spend draining the queue
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
    pub fn shutdown_grace(&self) -> Duration {
        self.grace
    }
    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::config("the queue capacity must be at least one"));
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the producer side                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The producer end of the queue; safe to share between threads.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: Sender<Vec<u8>>,
    overflow: OverflowPolicy,
    closed: Arc<AtomicBool>,
    stats: Arc<Stats>,
}

impl DeliveryQueue {
    fn new(settings: &QueueSettings, stats: Arc<Stats>) -> (DeliveryQueue, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(settings.capacity);
        (
            DeliveryQueue {
                tx,
                overflow: settings.overflow,
                closed: Arc::new(AtomicBool::new(false)),
                stats,
            },
            rx,
        )
    }
    /// Offer one payload for delivery; true if it was enqueued.
    ///
    /// Refusals are counted (as `overflowed` or `rejected_closed`), never reported as errors.
    pub fn submit(&self, payload: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            bump(&self.stats.rejected_closed);
            return false;
        }
        let full = match self.overflow {
            OverflowPolicy::DropNewest => match self.tx.try_send(payload) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some(false),
                Err(TrySendError::Disconnected(_)) => Some(true),
            },
            OverflowPolicy::Block(timeout) => match self.tx.send_timeout(payload, timeout) {
                Ok(()) => None,
                Err(SendTimeoutError::Timeout(_)) => Some(false),
                Err(SendTimeoutError::Disconnected(_)) => Some(true),
            },
        };
        match full {
            None => {
                bump(&self.stats.enqueued);
                true
            }
            Some(false) => {
                debug!("Delivery queue full; dropping a message");
                bump(&self.stats.overflowed);
                false
            }
            Some(true) => {
                bump(&self.stats.rejected_closed);
                false
            }
        }
    }
    /// The number of payloads waiting for the consumer
    pub fn len(&self) -> usize {
        self.tx.len()
    }
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the consumer side                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Consumer<T: Transport> {
    transport: T,
    rx: Receiver<Vec<u8>>,
    retry: VecDeque<Vec<u8>>,
    retry_capacity: usize,
    stats: Arc<Stats>,
}

impl<T: Transport> Consumer<T> {
    fn run(mut self, shutdown: Receiver<Instant>) -> u64 {
        if let Err(err) = self.transport.open() {
            error!("Couldn't reach the GELF collector at startup: {}", err);
        }
        let rx = self.rx.clone();
        loop {
            let tick = if self.retry.is_empty() {
                never()
            } else {
                let wait = self
                    .transport
                    .next_attempt()
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO);
                after(wait)
            };
            select! {
                recv(rx) -> msg => match msg {
                    Ok(payload) => self.deliver(payload),
                    // Every producer handle is gone; nothing more can arrive.
                    Err(_) => return self.drain(Instant::now()),
                },
                recv(shutdown) -> deadline => {
                    return self.drain(deadline.unwrap_or_else(|_| Instant::now()));
                },
                recv(tick) -> _ => self.flush_retry(),
            }
        }
    }

    fn deliver(&mut self, payload: Vec<u8>) {
        if !self.retry.is_empty() {
            self.flush_retry();
            if !self.retry.is_empty() {
                // Still down; queue behind the older payloads.
                self.park(payload, "the connection is down");
                return;
            }
        }
        match self.transport.send(&payload) {
            Ok(()) => bump(&self.stats.sent),
            Err(err) if err.is_retryable() => self.park(payload, &err.to_string()),
            Err(err) => {
                debug!("Dropping a message: {}", err);
                bump(&self.stats.send_errors);
            }
        }
    }

    /// Hold on to a payload the transport refused, if there's a retry buffer with room.
    fn park(&mut self, payload: Vec<u8>, reason: &str) {
        if self.retry_capacity == 0 {
            debug!("Dropping a message ({})", reason);
            bump(&self.stats.dropped_disconnected);
        } else if self.retry.len() >= self.retry_capacity {
            debug!("Retry buffer full; dropping a message ({})", reason);
            bump(&self.stats.dropped_retry_full);
        } else {
            self.retry.push_back(payload);
        }
    }

    fn flush_retry(&mut self) {
        while let Some(payload) = self.retry.pop_front() {
            match self.transport.send(&payload) {
                Ok(()) => {
                    bump(&self.stats.sent);
                    bump(&self.stats.retried);
                }
                Err(err) if err.is_retryable() => {
                    self.retry.push_front(payload);
                    break;
                }
                Err(err) => {
                    debug!("Dropping a buffered message: {}", err);
                    bump(&self.stats.send_errors);
                }
            }
        }
    }

    /// Deliver whatever we can before `deadline`, then close the transport. Returns the number
    /// of payloads abandoned.
    ///
    /// Queued payloads go through [`Consumer::deliver`] exactly as they would in `run`; the
    /// only waiting done here is for a reconnection while the retry buffer holds payloads.
    fn drain(&mut self, deadline: Instant) -> u64 {
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Ok(payload) = self.rx.try_recv() {
                self.deliver(payload);
                continue;
            }
            if self.retry.is_empty() {
                break;
            }
            match self.transport.next_attempt() {
                Some(at) if at >= deadline => break,
                Some(at) if at > now => std::thread::sleep(at - now),
                _ => (),
            }
            self.flush_retry();
            if !self.retry.is_empty() && self.transport.next_attempt().is_none() {
                break;
            }
        }
        let mut dropped = self.retry.len() as u64;
        self.retry.clear();
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                "Shutdown grace period expired; {} GELF messages were dropped",
                dropped
            );
        }
        add(&self.stats.dropped_shutdown, dropped);
        self.transport.close();
        dropped
    }
}

/// What happened at shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Payloads still queued (or parked for retry) when the grace period expired
    pub dropped: u64,
}

/// Owns the consumer thread.
pub struct Worker {
    handle: Option<JoinHandle<u64>>,
    shutdown: Sender<Instant>,
    closed: Arc<AtomicBool>,
}

impl Worker {
    /// Stop accepting submissions, give the consumer up to `grace` to drain the queue, then
    /// close the transport & wait for the consumer to exit.
    pub fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        self.stop(grace)
    }
    fn stop(&mut self, grace: Duration) -> ShutdownReport {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return ShutdownReport::default(),
        };
        self.closed.store(true, Ordering::Release);
        // The consumer may already be gone, if every producer handle was dropped.
        let _ = self.shutdown.send(Instant::now() + grace);
        match handle.join() {
            Ok(dropped) => {
                info!("GELF delivery stopped ({} messages dropped)", dropped);
                ShutdownReport { dropped }
            }
            Err(_) => {
                error!("The GELF delivery thread panicked");
                ShutdownReport::default()
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(Duration::ZERO);
    }
}

/// Create a queue & start its consumer, which takes ownership of `transport`.
pub fn spawn<T>(
    transport: T,
    settings: &QueueSettings,
    stats: Arc<Stats>,
) -> Result<(DeliveryQueue, Worker)>
where
    T: Transport + 'static,
{
    settings.validate()?;
    let (queue, rx) = DeliveryQueue::new(settings, stats.clone());
    let (shutdown_tx, shutdown_rx) = bounded(1);
    let consumer = Consumer {
        transport,
        rx,
        retry: VecDeque::with_capacity(settings.retry_capacity),
        retry_capacity: settings.retry_capacity,
        stats,
    };
    let handle = std::thread::Builder::new()
        .name("gelf-delivery".to_string())
        .spawn(move || consumer.run(shutdown_rx))
        .map_err(Error::transport)?;
    let worker = Worker {
        handle: Some(handle),
        shutdown: shutdown_tx,
        closed: queue.closed.clone(),
    };
    Ok((queue, worker))
}

#[cfg(test)]
mod test {

    use super::*;

    use crate::{
        connection::{
            scripted::{Outcome, ScriptedConnector},
            Backoff,
        },
        transport::StreamTransport,
    };

    // Long enough that all three submissions are consumed before the first reconnection attempt
    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(250), Duration::from_secs(1))
    }

    #[test]
    fn overflow_never_blocks() {
        let stats = Arc::new(Stats::new());
        let (queue, _rx) = DeliveryQueue::new(&QueueSettings::new().capacity(2), stats.clone());
        let start = Instant::now();
        let accepted: Vec<bool> = (0..5u8).map(|i| queue.submit(vec![i])).collect();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(accepted, vec![true, true, false, false, false]);
        let snap = stats.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.overflowed, 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_blocks_up_to_timeout() {
        let stats = Arc::new(Stats::new());
        let settings = QueueSettings::new()
            .capacity(1)
            .overflow(OverflowPolicy::Block(Duration::from_millis(50)));
        let (queue, rx) = DeliveryQueue::new(&settings, stats.clone());
        assert!(queue.submit(vec![0]));
        let start = Instant::now();
        assert!(!queue.submit(vec![1]));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(stats.snapshot().overflowed, 1);
        // Room appears: the blocked submission succeeds
        rx.recv().unwrap();
        assert!(queue.submit(vec![2]));
    }

    #[test]
    fn fifo() {
        let (connector, wire) = ScriptedConnector::new(&[]);
        let stats = Arc::new(Stats::new());
        let (queue, worker) = spawn(
            StreamTransport::new(connector, fast_backoff()),
            &QueueSettings::new(),
            stats.clone(),
        )
        .unwrap();
        let sent: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_string().into_bytes()).collect();
        for msg in &sent {
            assert!(queue.submit(msg.clone()));
        }
        let report = worker.shutdown(Duration::from_secs(5));
        assert_eq!(report.dropped, 0);
        assert_eq!(wire.frames(), sent);
        assert_eq!(stats.snapshot().sent, 100);
        // Closed for business
        assert!(!queue.submit(b"late".to_vec()));
        assert_eq!(stats.snapshot().rejected_closed, 1);
    }

    fn three_messages(retry_capacity: usize) -> (Vec<Vec<u8>>, Arc<Stats>, ShutdownReport) {
        // The first connection breaks after one frame; the second is healthy.
        let (connector, wire) = ScriptedConnector::new(&[Outcome::Accept(1)]);
        let stats = Arc::new(Stats::new());
        let (queue, worker) = spawn(
            StreamTransport::new(connector, fast_backoff()),
            &QueueSettings::new().retry_capacity(retry_capacity),
            stats.clone(),
        )
        .unwrap();
        for msg in [&b"one"[..], b"two", b"three"] {
            assert!(queue.submit(msg.to_vec()));
        }
        let report = worker.shutdown(Duration::from_secs(5));
        (wire.frames(), stats, report)
    }

    #[test]
    fn retried_after_reconnect() {
        let (frames, stats, report) = three_messages(16);
        assert_eq!(
            frames,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.retried, 2);
        assert_eq!(snap.dropped(), 0);
        assert_eq!(report.dropped, 0);
    }

    #[test]
    fn dropped_without_retry_buffer() {
        let (frames, stats, report) = three_messages(0);
        assert_eq!(frames, vec![b"one".to_vec()]);
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.dropped_disconnected, 2);
        assert_eq!(snap.retried, 0);
        assert_eq!(report.dropped, 0);
    }

    #[test]
    fn retry_buffer_is_bounded() {
        let (frames, stats, _report) = three_messages(1);
        // "two" is parked; "three" finds the buffer full
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        let snap = stats.snapshot();
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.dropped_retry_full, 1);
    }

    #[test]
    fn drain_sheds_while_disconnected() {
        // Shutdown can reach the consumer before it has looked at the queue; the backlog
        // must meet the same fate it would have in the run loop.
        let (connector, wire) = ScriptedConnector::new(&[Outcome::Accept(1)]);
        let stats = Arc::new(Stats::new());
        let (queue, rx) = DeliveryQueue::new(&QueueSettings::new(), stats.clone());
        for msg in [&b"one"[..], b"two", b"three"] {
            assert!(queue.submit(msg.to_vec()));
        }
        let mut consumer = Consumer {
            transport: StreamTransport::new(connector, fast_backoff()),
            rx,
            retry: VecDeque::new(),
            retry_capacity: 0,
            stats: stats.clone(),
        };
        consumer.transport.open().unwrap();
        let start = Instant::now();
        let dropped = consumer.drain(Instant::now() + Duration::from_secs(5));
        // No waiting out the reconnect delay
        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(dropped, 0);
        assert_eq!(wire.frames(), vec![b"one".to_vec()]);
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.dropped_disconnected, 2);
        assert_eq!(snap.dropped_shutdown, 0);
    }

    #[test]
    fn grace_period_expires() {
        // Every connection attempt fails; with a long backoff nothing can be sent in time.
        let (connector, _wire) = ScriptedConnector::new(&[Outcome::Refuse; 4]);
        let stats = Arc::new(Stats::new());
        let (queue, worker) = spawn(
            StreamTransport::new(
                connector,
                Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            ),
            &QueueSettings::new().retry_capacity(8),
            stats.clone(),
        )
        .unwrap();
        for i in 0..3u8 {
            assert!(queue.submit(vec![i]));
        }
        let start = Instant::now();
        let report = worker.shutdown(Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(report.dropped, 3);
        assert_eq!(stats.snapshot().dropped_shutdown, 3);
        assert_eq!(stats.snapshot().sent, 0);
    }
}
