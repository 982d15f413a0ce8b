//! Tracking session: owns the ingest queue, the worker thread and the capture loops.

use crate::calibration::CalibrationStatus;
use crate::capture::{CaptureLoop, CaptureSource};
use crate::config::{CalibrationStore, TrackerConfig};
use crate::device::RigidBody;
use crate::pipeline::{BodyState, Control, Pipeline, SharedSnapshot, Snapshot};
use crate::playback::PlaybackSource;
use crate::queue::{ingest_queue, EventDrain, EventSink, QueueConfig, WaitStatus};
use crate::report::{ReportFilter, Reporter, ReporterRegistry};
use crate::types::{LighthouseId, LighthouseInfo};
use crate::{Result, TrackerError};
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How long the worker sleeps between checks when nothing arrives.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Collects everything a session needs before it starts.
pub struct SessionBuilder {
    config: TrackerConfig,
    registry: ReporterRegistry,
    bodies: Vec<RigidBody>,
    sources: Vec<Box<dyn CaptureSource>>,
    queue: QueueConfig,
    grace_period: Duration,
}

impl SessionBuilder {
    pub fn new(config: TrackerConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            registry: ReporterRegistry::new(),
            bodies: Vec::new(),
            sources: Vec::new(),
            queue: QueueConfig::default(),
            grace_period: Duration::from_millis(500),
        }
    }

    pub fn reporter(mut self, reporter: Box<dyn Reporter>, filter: ReportFilter) -> Self {
        self.registry.register(reporter, filter);
        self
    }

    /// Register a body up front instead of waiting for its device announcement.
    pub fn body(mut self, body: RigidBody) -> Self {
        self.bodies.push(body);
        self
    }

    pub fn capture(mut self, source: Box<dyn CaptureSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Time allowed at shutdown for queued events to drain.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Validate the config and load any stored calibration.
    pub fn build(self) -> Result<TrackerSession> {
        self.config.validate()?;

        let store = match &self.config.config_file {
            Some(path) => Some(CalibrationStore::load_or_default(path).map_err(|e| {
                TrackerError::ContextInitFailure(format!("Failed to load {}: {}", path.display(), e))
            })?),
            None => None,
        };

        let mut sources = self.sources;
        if let Some(path) = &self.config.playback_file {
            let source = PlaybackSource::open(path, self.config.playback_factor).map_err(|e| {
                TrackerError::ContextInitFailure(format!("Failed to open playback {}: {}", path.display(), e))
            })?;
            sources.push(Box::new(source));
        }

        let mut pipeline = Pipeline::new(&self.config, self.registry, store.as_ref());
        for body in self.bodies {
            pipeline.register_body(body);
        }
        pipeline.publish();
        let snapshot = pipeline.shared();

        log::info!("Session configured: {}", self.config.to_args().join(" "));

        Ok(TrackerSession {
            pending: Some(Pending {
                pipeline,
                sources,
                queue: self.queue,
            }),
            config_file: self.config.config_file.clone(),
            grace_period: self.grace_period,
            snapshot,
            sink: None,
            shutdown_tx: None,
            control_tx: None,
            worker: None,
            captures: Vec::new(),
        })
    }
}

struct Pending {
    pipeline: Pipeline,
    sources: Vec<Box<dyn CaptureSource>>,
    queue: QueueConfig,
}

/// A running (or ready to run) tracking pipeline.
///
/// Sessions are independent; several may run side by side. Dropping a session
/// shuts it down.
pub struct TrackerSession {
    pending: Option<Pending>,
    config_file: Option<PathBuf>,
    grace_period: Duration,
    snapshot: SharedSnapshot,
    sink: Option<EventSink>,
    shutdown_tx: Option<Sender<()>>,
    control_tx: Option<Sender<Control>>,
    worker: Option<std::thread::JoinHandle<()>>,
    captures: Vec<CaptureLoop>,
}

impl TrackerSession {
    pub fn builder(config: TrackerConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Start the worker and any capture sources.
    ///
    /// Returns a sink for pushing events directly. A session starts once;
    /// later calls fail with [`TrackerError::DoubleStart`].
    pub fn start(&mut self) -> Result<EventSink> {
        let Some(pending) = self.pending.take() else {
            return Err(TrackerError::DoubleStart);
        };
        let Pending {
            pipeline,
            sources,
            queue,
        } = pending;

        let (sink, drain) = ingest_queue(queue);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let grace = self.grace_period;
        let config_file = self.config_file.clone();

        let worker = std::thread::Builder::new()
            .name("lightsweep-worker".into())
            .spawn(move || {
                worker_loop(pipeline, drain, shutdown_rx, control_rx, grace, config_file);
            })
            .map_err(|e| TrackerError::ContextInitFailure(format!("Failed to spawn worker thread: {}", e)))?;

        self.worker = Some(worker);
        self.shutdown_tx = Some(shutdown_tx);
        self.control_tx = Some(control_tx);
        self.sink = Some(sink.clone());

        for source in sources {
            match CaptureLoop::start(source, sink.clone()) {
                Ok(capture) => self.captures.push(capture),
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }
        log::info!("Session started with {} capture sources", self.captures.len());
        Ok(sink)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// A further sink for another producer.
    pub fn sink(&self) -> Option<EventSink> {
        self.sink.clone()
    }

    /// Whether every capture source has run dry. True when there are none.
    pub fn captures_finished(&self) -> bool {
        self.captures.iter().all(|c| c.is_finished())
    }

    /// Poll until every capture source finishes or `timeout` passes.
    pub fn wait_for_captures(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.captures_finished() {
            if Instant::now() >= deadline {
                return Err(TrackerError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Restart calibration from `NotCalibrating`, even if it was disabled.
    pub fn recalibrate(&self) -> Result<()> {
        let tx = self.control_tx.as_ref().ok_or(TrackerError::NotRunning)?;
        tx.send(Control::Recalibrate)
            .map_err(|_| TrackerError::ChannelDisconnected)
    }

    /// Copy of the latest published state.
    pub fn snapshot(&self) -> Snapshot {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn lighthouses(&self) -> BTreeMap<LighthouseId, LighthouseInfo> {
        self.snapshot().lighthouses
    }

    pub fn body(&self, name: &str) -> Option<BodyState> {
        self.snapshot().bodies.into_values().find(|b| b.name == name)
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.snapshot().calibration
    }

    /// Stop capture, drain what is queued within the grace period and join the worker.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        for capture in self.captures.iter_mut() {
            capture.shutdown();
        }
        self.captures.clear();
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
        self.control_tx = None;
        // Dropping the sender wakes the worker.
        self.shutdown_tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Worker thread panicked");
            }
            log::info!("Session shut down");
        }
        self.pending = None;
    }
}

impl Drop for TrackerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut pipeline: Pipeline,
    mut drain: EventDrain,
    shutdown: Receiver<()>,
    control: Receiver<Control>,
    grace: Duration,
    config_file: Option<PathBuf>,
) {
    log::info!("Worker started");

    loop {
        let status = drain.wait(&shutdown, IDLE_WAIT);
        while let Ok(command) = control.try_recv() {
            pipeline.control(command);
        }
        for event in drain.drain() {
            pipeline.handle(event);
        }
        for diagnostic in drain.overflow_diagnostics() {
            pipeline.report_diagnostic(diagnostic);
        }
        pipeline.publish();
        if status == WaitStatus::Shutdown {
            log::info!("Worker stopping (shutdown signalled)");
            break;
        }
    }

    // No new input; whatever is queued gets the grace period.
    drain.close();
    let deadline = Instant::now() + grace;
    let mut drained = 0usize;
    while Instant::now() < deadline {
        let Some(event) = drain.drain().next() else {
            break;
        };
        pipeline.handle(event);
        drained += 1;
    }
    if drained > 0 {
        log::debug!("Drained {} events during shutdown", drained);
    }

    if let Some(store) = pipeline.finish() {
        match config_file {
            Some(path) => {
                if let Err(e) = store.save(&path) {
                    log::warn!("Failed to save calibration to {}: {}", path.display(), e);
                }
            }
            None => log::info!("Calibration finished; no config file to save it to"),
        }
    }
}
