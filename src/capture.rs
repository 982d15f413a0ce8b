use crate::queue::EventSink;
use crate::{Result, TrackerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// More data may follow.
    Continue,
    /// The source is exhausted; the loop exits.
    Finished,
}

/// A transport that produces tracking events.
///
/// `poll` is called in a loop on the capture thread. It should push whatever
/// is available and return within a bounded time (a read timeout, a short
/// sleep) so the stop flag is checked regularly.
pub trait CaptureSource: Send {
    fn name(&self) -> &str;

    fn poll(&mut self, sink: &EventSink) -> Result<PollStatus>;
}

/// Handle to a capture thread pulling from one [`CaptureSource`].
pub struct CaptureLoop {
    stop_flag: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureLoop {
    /// Start the capture thread. The thread owns the source.
    pub fn start(source: Box<dyn CaptureSource>, sink: EventSink) -> Result<CaptureLoop> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let finished_clone = finished.clone();

        let thread = std::thread::Builder::new()
            .name(format!("lightsweep-capture-{}", source.name()))
            .spawn(move || {
                capture_loop(source, sink, stop_clone);
                finished_clone.store(true, Ordering::Release);
            })
            .map_err(|e| TrackerError::ContextInitFailure(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(CaptureLoop {
            stop_flag,
            finished,
            thread: Some(thread),
        })
    }

    /// Whether the source is still being polled.
    pub fn is_active(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed) && !self.is_finished()
    }

    /// Whether the loop has exited, by exhaustion, error or stop request.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stop polling and wait for the capture thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub(crate) fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(mut source: Box<dyn CaptureSource>, sink: EventSink, stop_flag: Arc<AtomicBool>) {
    log::info!("Capture from {} started", source.name());

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::info!("Capture from {} stopping (stop flag set)", source.name());
            break;
        }

        match source.poll(&sink) {
            Ok(PollStatus::Continue) => {}
            Ok(PollStatus::Finished) => {
                log::info!("Capture from {} finished", source.name());
                break;
            }
            Err(TrackerError::QueueOverflow(lane)) => {
                log::trace!("Capture from {}: {} lane full, event dropped", source.name(), lane);
            }
            Err(TrackerError::NotRunning) => {
                log::info!("Capture from {}: session closed, stopping", source.name());
                break;
            }
            Err(e) => {
                log::warn!("Capture from {} failed: {}", source.name(), e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ingest_queue, QueueConfig};
    use crate::types::{Event, ObjectId};
    use std::time::{Duration, Instant};

    struct Counter {
        remaining: u32,
    }

    impl CaptureSource for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn poll(&mut self, sink: &EventSink) -> Result<PollStatus> {
            if self.remaining == 0 {
                return Ok(PollStatus::Finished);
            }
            self.remaining -= 1;
            sink.push(Event::Status {
                object: ObjectId::from_name("WM0").unwrap(),
                charge: self.remaining as u8,
                charging: false,
            })?;
            Ok(PollStatus::Continue)
        }
    }

    struct Idle;

    impl CaptureSource for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn poll(&mut self, _sink: &EventSink) -> Result<PollStatus> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(PollStatus::Continue)
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_finite_source_finishes() {
        let (sink, mut drain) = ingest_queue(QueueConfig::default());
        let capture = CaptureLoop::start(Box::new(Counter { remaining: 5 }), sink).unwrap();
        assert!(wait_until(|| capture.is_finished()));
        assert!(!capture.is_active());
        assert_eq!(drain.drain().count(), 5);
    }

    #[test]
    fn test_closed_sink_stops_loop() {
        let (sink, drain) = ingest_queue(QueueConfig::default());
        drain.close();
        let capture = CaptureLoop::start(Box::new(Counter { remaining: 100 }), sink).unwrap();
        assert!(wait_until(|| capture.is_finished()));
    }

    #[test]
    fn test_stop_joins_thread() {
        let (sink, _drain) = ingest_queue(QueueConfig::default());
        let capture = CaptureLoop::start(Box::new(Idle), sink).unwrap();
        assert!(capture.is_active());
        capture.stop();
    }
}
