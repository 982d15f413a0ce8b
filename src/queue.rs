//! Event ingest queue between capture threads and the pipeline worker.
//!
//! Two bounded crossbeam lanes carry events: a lossless lane for light, sync,
//! button, status and device events, and a lossy lane for IMU samples. Every
//! push takes a global arrival sequence number so the single consumer can merge
//! the lanes back into arrival order. Numbering and sending happen under one
//! lock shared by every sink clone, so each lane holds strictly increasing
//! sequence numbers even with several producers.

use crate::error::Diagnostic;
use crate::types::Event;
use crate::{Result, TrackerError};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Light,
    Imu,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Light => f.write_str("light"),
            Lane::Imu => f.write_str("imu"),
        }
    }
}

/// What to do with an IMU sample when its lane is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued IMU sample to make room.
    #[default]
    DropOldestImu,
    /// Drop the sample being pushed.
    DropNewest,
    /// Refuse the push and return an error to the producer.
    Reject,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub light_capacity: usize,
    pub imu_capacity: usize,
    pub policy: OverflowPolicy,
    /// Yield attempts before a full light lane is reported as overflow.
    pub spin_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            light_capacity: 8192,
            imu_capacity: 1024,
            policy: OverflowPolicy::DropOldestImu,
            spin_limit: 64,
        }
    }
}

/// Counters shared by every producer and the consumer.
#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    imu_dropped: AtomicU64,
    light_overflows: AtomicU64,
}

impl QueueStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn imu_dropped(&self) -> u64 {
        self.imu_dropped.load(Ordering::Relaxed)
    }

    pub fn light_overflows(&self) -> u64 {
        self.light_overflows.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Sequenced {
    seq: u64,
    event: Event,
}

/// Create a connected producer/consumer pair.
pub fn ingest_queue(config: QueueConfig) -> (EventSink, EventDrain) {
    let (light_tx, light_rx) = crossbeam_channel::bounded(config.light_capacity.max(1));
    let (imu_tx, imu_rx) = crossbeam_channel::bounded(config.imu_capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    let closed = Arc::new(AtomicBool::new(false));

    let sink = EventSink {
        light_tx,
        imu_tx,
        imu_evict: imu_rx.clone(),
        seq: Arc::new(Mutex::new(0)),
        stats: stats.clone(),
        closed: closed.clone(),
        policy: config.policy,
        spin_limit: config.spin_limit,
    };
    let drain = EventDrain {
        light_rx,
        imu_rx,
        light_head: None,
        imu_head: None,
        stats,
        closed,
        reported_imu_dropped: 0,
        reported_light_overflows: 0,
    };
    (sink, drain)
}

/// Producer handle. Cheap to clone, one per capture thread.
#[derive(Clone)]
pub struct EventSink {
    light_tx: Sender<Sequenced>,
    imu_tx: Sender<Sequenced>,
    // Lets producers evict the oldest IMU sample under DropOldestImu.
    imu_evict: Receiver<Sequenced>,
    seq: Arc<Mutex<u64>>,
    stats: Arc<QueueStats>,
    closed: Arc<AtomicBool>,
    policy: OverflowPolicy,
    spin_limit: u32,
}

impl EventSink {
    /// Push an event without blocking beyond a bounded yield loop.
    ///
    /// Light-lane events are never dropped silently: if the lane stays full the
    /// push fails with [`TrackerError::QueueOverflow`] and the overflow is
    /// counted for the consumer to report.
    pub fn push(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TrackerError::NotRunning);
        }
        let mut next = self.seq.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let item = Sequenced { seq: *next, event };
        *next += 1;
        let result = if matches!(item.event, Event::Imu(_)) {
            self.push_imu(item)
        } else {
            self.push_light(item)
        };
        drop(next);
        if result.is_ok() {
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn push_light(&self, mut item: Sequenced) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.light_tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(TrackerError::ChannelDisconnected),
                Err(TrySendError::Full(back)) => {
                    if attempts >= self.spin_limit {
                        self.stats.light_overflows.fetch_add(1, Ordering::Relaxed);
                        log::warn!("light lane full, rejecting event seq {}", back.seq);
                        return Err(TrackerError::QueueOverflow(Lane::Light));
                    }
                    attempts += 1;
                    item = back;
                    std::thread::yield_now();
                }
            }
        }
    }

    fn push_imu(&self, item: Sequenced) -> Result<()> {
        match self.imu_tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(TrackerError::ChannelDisconnected),
            Err(TrySendError::Full(item)) => match self.policy {
                OverflowPolicy::DropOldestImu => {
                    if self.imu_evict.try_recv().is_ok() {
                        self.stats.imu_dropped.fetch_add(1, Ordering::Relaxed);
                        log::trace!("imu lane full, evicted oldest sample");
                    }
                    match self.imu_tx.try_send(item) {
                        Ok(()) => Ok(()),
                        Err(TrySendError::Disconnected(_)) => Err(TrackerError::ChannelDisconnected),
                        Err(TrySendError::Full(_)) => {
                            // Another producer refilled the slot first.
                            self.stats.imu_dropped.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                    }
                }
                OverflowPolicy::DropNewest => {
                    self.stats.imu_dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("imu lane full, dropping sample");
                    Ok(())
                }
                OverflowPolicy::Reject => {
                    self.stats.imu_dropped.fetch_add(1, Ordering::Relaxed);
                    Err(TrackerError::QueueOverflow(Lane::Imu))
                }
            },
        }
    }

    /// Stop accepting new events. Queued events can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one event can be drained.
    Ready,
    /// Shutdown was signalled or every producer is gone.
    Shutdown,
    TimedOut,
}

/// Single-consumer end of the ingest queue.
pub struct EventDrain {
    light_rx: Receiver<Sequenced>,
    imu_rx: Receiver<Sequenced>,
    light_head: Option<Sequenced>,
    imu_head: Option<Sequenced>,
    stats: Arc<QueueStats>,
    closed: Arc<AtomicBool>,
    reported_imu_dropped: u64,
    reported_light_overflows: u64,
}

impl EventDrain {
    fn has_pending(&self) -> bool {
        self.light_head.is_some()
            || self.imu_head.is_some()
            || !self.light_rx.is_empty()
            || !self.imu_rx.is_empty()
    }

    /// Block until an event is queued, `shutdown` fires, or `timeout` elapses.
    pub fn wait(&mut self, shutdown: &Receiver<()>, timeout: Duration) -> WaitStatus {
        if self.has_pending() {
            return WaitStatus::Ready;
        }
        crossbeam_channel::select! {
            recv(self.light_rx) -> msg => match msg {
                Ok(item) => {
                    self.light_head = Some(item);
                    WaitStatus::Ready
                }
                Err(_) => WaitStatus::Shutdown,
            },
            recv(self.imu_rx) -> msg => match msg {
                Ok(item) => {
                    self.imu_head = Some(item);
                    WaitStatus::Ready
                }
                Err(_) => WaitStatus::Shutdown,
            },
            recv(shutdown) -> _ => WaitStatus::Shutdown,
            default(timeout) => WaitStatus::TimedOut,
        }
    }

    /// Lazily yield every currently queued event in arrival order.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { queue: self }
    }

    fn next_event(&mut self) -> Option<Event> {
        if self.light_head.is_none() {
            self.light_head = match self.light_rx.try_recv() {
                Ok(item) => Some(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            };
        }
        if self.imu_head.is_none() {
            self.imu_head = self.imu_rx.try_recv().ok();
        }
        let take_light = match (&self.light_head, &self.imu_head) {
            (Some(l), Some(i)) => l.seq < i.seq,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        let item = if take_light {
            self.light_head.take()
        } else {
            self.imu_head.take()
        };
        item.map(|s| s.event)
    }

    /// Overflow diagnostics accumulated since the previous call.
    pub fn overflow_diagnostics(&mut self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        let imu = self.stats.imu_dropped();
        if imu > self.reported_imu_dropped {
            out.push(Diagnostic::QueueOverflow {
                lane: Lane::Imu,
                count: imu - self.reported_imu_dropped,
            });
            self.reported_imu_dropped = imu;
        }
        let light = self.stats.light_overflows();
        if light > self.reported_light_overflows {
            out.push(Diagnostic::QueueOverflow {
                lane: Lane::Light,
                count: light - self.reported_light_overflows,
            });
            self.reported_light_overflows = light;
        }
        out
    }

    /// Refuse further pushes from every sink.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

pub struct Drain<'a> {
    queue: &'a mut EventDrain,
}

impl Iterator for Drain<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.queue.next_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImuPresence, ImuSample, LightHit, ObjectId, SweepAxis};

    fn obj() -> ObjectId {
        ObjectId::from_name("TR0").unwrap()
    }

    fn light(timecode: u64) -> Event {
        Event::Light(LightHit {
            object: obj(),
            sensor: 1,
            axis: SweepAxis::Horizontal,
            time_in_sweep: 200_000,
            timecode,
            pulse_length: 100,
            lighthouse: 0,
        })
    }

    fn imu(timecode: u64) -> Event {
        Event::Imu(ImuSample {
            object: obj(),
            accel: [0.0, 0.0, 1.0],
            gyro: [0.0; 3],
            mag: [0.0; 3],
            timecode,
            presence: ImuPresence::ACCEL | ImuPresence::GYRO,
        })
    }

    #[test]
    fn test_concurrent_producers_keep_lane_sequence() {
        let (sink, drain) = ingest_queue(QueueConfig {
            light_capacity: 10_000,
            ..QueueConfig::default()
        });
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000u64 {
                        sink.push(light(p * 10_000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let seqs: Vec<u64> = drain.light_rx.try_iter().map(|item| item.seq).collect();
        assert_eq!(seqs.len(), 8_000);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_drain_preserves_arrival_order_across_lanes() {
        let (sink, mut drain) = ingest_queue(QueueConfig::default());
        sink.push(light(1)).unwrap();
        sink.push(imu(2)).unwrap();
        sink.push(light(3)).unwrap();
        sink.push(imu(4)).unwrap();
        let order: Vec<u64> = drain.drain().filter_map(|e| e.timecode()).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_imu_drop_oldest() {
        let config = QueueConfig {
            imu_capacity: 2,
            ..QueueConfig::default()
        };
        let (sink, mut drain) = ingest_queue(config);
        for t in 1..=4 {
            sink.push(imu(t)).unwrap();
        }
        let order: Vec<u64> = drain.drain().filter_map(|e| e.timecode()).collect();
        assert_eq!(order, vec![3, 4]);
        let diags = drain.overflow_diagnostics();
        assert_eq!(
            diags,
            vec![Diagnostic::QueueOverflow {
                lane: Lane::Imu,
                count: 2
            }]
        );
        assert!(drain.overflow_diagnostics().is_empty());
    }

    #[test]
    fn test_imu_drop_newest_and_reject() {
        let config = QueueConfig {
            imu_capacity: 1,
            policy: OverflowPolicy::DropNewest,
            ..QueueConfig::default()
        };
        let (sink, mut drain) = ingest_queue(config);
        sink.push(imu(1)).unwrap();
        sink.push(imu(2)).unwrap();
        let order: Vec<u64> = drain.drain().filter_map(|e| e.timecode()).collect();
        assert_eq!(order, vec![1]);

        let config = QueueConfig {
            imu_capacity: 1,
            policy: OverflowPolicy::Reject,
            ..QueueConfig::default()
        };
        let (sink, _drain) = ingest_queue(config);
        sink.push(imu(1)).unwrap();
        assert!(matches!(
            sink.push(imu(2)),
            Err(TrackerError::QueueOverflow(Lane::Imu))
        ));
    }

    #[test]
    fn test_light_overflow_is_reported_not_silent() {
        let config = QueueConfig {
            light_capacity: 1,
            spin_limit: 2,
            ..QueueConfig::default()
        };
        let (sink, mut drain) = ingest_queue(config);
        sink.push(light(1)).unwrap();
        assert!(matches!(
            sink.push(light(2)),
            Err(TrackerError::QueueOverflow(Lane::Light))
        ));
        assert_eq!(
            drain.overflow_diagnostics(),
            vec![Diagnostic::QueueOverflow {
                lane: Lane::Light,
                count: 1
            }]
        );
    }

    #[test]
    fn test_wait_and_close() {
        let (sink, mut drain) = ingest_queue(QueueConfig::default());
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        assert_eq!(
            drain.wait(&shutdown_rx, Duration::from_millis(5)),
            WaitStatus::TimedOut
        );
        sink.push(light(7)).unwrap();
        assert_eq!(
            drain.wait(&shutdown_rx, Duration::from_millis(5)),
            WaitStatus::Ready
        );
        assert_eq!(drain.drain().count(), 1);

        drop(shutdown_tx);
        assert_eq!(
            drain.wait(&shutdown_rx, Duration::from_secs(1)),
            WaitStatus::Shutdown
        );

        sink.close();
        assert!(matches!(sink.push(light(8)), Err(TrackerError::NotRunning)));
    }
}
