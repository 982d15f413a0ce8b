use crate::calibration::CalibrationStatus;
use crate::types::{
    AngleMeasurement, ButtonEvent, DeviceAnnouncement, ImuSample, LightHit, LighthouseInfo, Message, MessageLevel,
    SyncPulse, TimedPose,
};
use crate::{Result, TrackerError};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

bitflags::bitflags! {
    /// Event kinds a reporter wants to receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReportFilter: u16 {
        const LIGHT      = 1 << 0;
        const POSE       = 1 << 1;
        const LIGHTHOUSE = 1 << 2;
        const ANGLE      = 1 << 3;
        const BUTTON     = 1 << 4;
        const CONFIG     = 1 << 5;
        const IMU        = 1 << 6;
        const ERROR      = 1 << 7;
        const INFO       = 1 << 8;
    }
}

impl Default for ReportFilter {
    /// Everything except buttons.
    fn default() -> Self {
        ReportFilter::all() - ReportFilter::BUTTON
    }
}

/// Observer for pipeline output.
///
/// Every method has a no-op default, so an implementation only overrides the
/// kinds it cares about. `object` is the codename of the body the event
/// belongs to; lighthouse reports use `LH<id>`.
pub trait Reporter: Send {
    fn on_light(&mut self, _object: &str, _hit: &LightHit) {}
    fn on_sync(&mut self, _object: &str, _pulse: &SyncPulse) {}
    fn on_angle(&mut self, _object: &str, _angle: &AngleMeasurement) {}
    /// Calibrated sample in IMU axes.
    fn on_imu(&mut self, _object: &str, _sample: &ImuSample) {}
    /// Sample as it arrived, before device calibration.
    fn on_raw_imu(&mut self, _object: &str, _sample: &ImuSample) {}
    fn on_pose(&mut self, _object: &str, _pose: &TimedPose) {}
    fn on_button(&mut self, _object: &str, _button: &ButtonEvent) {}
    fn on_lighthouse(&mut self, _object: &str, _info: &LighthouseInfo) {}
    fn on_config(&mut self, _object: &str, _device: &DeviceAnnouncement) {}
    fn on_calibration(&mut self, _object: &str, _status: CalibrationStatus) {}
    fn on_message(&mut self, _object: &str, _message: &Message) {}
}

/// Reporters registered with a session, each behind its own filter.
#[derive(Default)]
pub struct ReporterRegistry {
    entries: Vec<(ReportFilter, Box<dyn Reporter>)>,
}

impl ReporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reporter: Box<dyn Reporter>, filter: ReportFilter) {
        self.entries.push((filter, reporter));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any reporter accepts this kind.
    pub fn wants(&self, kind: ReportFilter) -> bool {
        self.entries.iter().any(|(f, _)| f.intersects(kind))
    }

    fn each(&mut self, kind: ReportFilter, mut f: impl FnMut(&mut dyn Reporter)) {
        for (filter, reporter) in self.entries.iter_mut() {
            if filter.intersects(kind) {
                f(reporter.as_mut());
            }
        }
    }

    pub fn light(&mut self, object: &str, hit: &LightHit) {
        self.each(ReportFilter::LIGHT, |r| r.on_light(object, hit));
    }

    pub fn sync(&mut self, object: &str, pulse: &SyncPulse) {
        self.each(ReportFilter::LIGHT, |r| r.on_sync(object, pulse));
    }

    pub fn angle(&mut self, object: &str, angle: &AngleMeasurement) {
        self.each(ReportFilter::ANGLE, |r| r.on_angle(object, angle));
    }

    pub fn imu(&mut self, object: &str, sample: &ImuSample) {
        self.each(ReportFilter::IMU, |r| r.on_imu(object, sample));
    }

    pub fn raw_imu(&mut self, object: &str, sample: &ImuSample) {
        self.each(ReportFilter::IMU, |r| r.on_raw_imu(object, sample));
    }

    pub fn pose(&mut self, object: &str, pose: &TimedPose) {
        self.each(ReportFilter::POSE, |r| r.on_pose(object, pose));
    }

    pub fn button(&mut self, object: &str, button: &ButtonEvent) {
        self.each(ReportFilter::BUTTON, |r| r.on_button(object, button));
    }

    pub fn lighthouse(&mut self, info: &LighthouseInfo) {
        let name = lighthouse_name(info.id);
        self.each(ReportFilter::LIGHTHOUSE, |r| r.on_lighthouse(&name, info));
    }

    pub fn config(&mut self, object: &str, device: &DeviceAnnouncement) {
        self.each(ReportFilter::CONFIG, |r| r.on_config(object, device));
    }

    pub fn calibration(&mut self, object: &str, status: CalibrationStatus) {
        self.each(ReportFilter::LIGHTHOUSE, |r| r.on_calibration(object, status));
    }

    pub fn message(&mut self, object: &str, message: &Message) {
        let kind = match message.level {
            MessageLevel::Info => ReportFilter::INFO,
            MessageLevel::Warning | MessageLevel::Error => ReportFilter::ERROR,
        };
        self.each(kind, |r| r.on_message(object, message));
    }
}

pub fn lighthouse_name(id: crate::types::LighthouseId) -> String {
    format!("LH{}", id)
}

/// Owned copy of one reporter call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Light { object: String, hit: LightHit },
    Sync { object: String, pulse: SyncPulse },
    Angle { object: String, angle: AngleMeasurement },
    Imu { object: String, sample: ImuSample },
    Pose { object: String, pose: TimedPose },
    Button { object: String, button: ButtonEvent },
    Lighthouse { object: String, info: LighthouseInfo },
    Config { object: String, device: DeviceAnnouncement },
    Calibration { object: String, status: CalibrationStatus },
    Message { object: String, message: Message },
}

/// Reporter that forwards every call into a bounded channel.
///
/// When the consumer falls behind, new events are dropped and counted.
pub struct ChannelReporter {
    sender: Sender<ReportEvent>,
    active: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl ChannelReporter {
    pub fn new(capacity: usize) -> (ChannelReporter, EventStream) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let active = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            ChannelReporter {
                sender,
                active: active.clone(),
                dropped: dropped.clone(),
            },
            EventStream {
                receiver,
                active,
                dropped,
            },
        )
    }

    fn send(&self, event: ReportEvent) {
        if let Err(e) = self.sender.try_send(event) {
            match e {
                crossbeam_channel::TrySendError::Full(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Report channel full, dropping event");
                }
                crossbeam_channel::TrySendError::Disconnected(_) => {
                    log::trace!("Report channel disconnected");
                }
            }
        }
    }
}

impl Drop for ChannelReporter {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

impl Reporter for ChannelReporter {
    fn on_light(&mut self, object: &str, hit: &LightHit) {
        self.send(ReportEvent::Light {
            object: object.to_string(),
            hit: *hit,
        });
    }

    fn on_sync(&mut self, object: &str, pulse: &SyncPulse) {
        self.send(ReportEvent::Sync {
            object: object.to_string(),
            pulse: *pulse,
        });
    }

    fn on_angle(&mut self, object: &str, angle: &AngleMeasurement) {
        self.send(ReportEvent::Angle {
            object: object.to_string(),
            angle: *angle,
        });
    }

    fn on_imu(&mut self, object: &str, sample: &ImuSample) {
        self.send(ReportEvent::Imu {
            object: object.to_string(),
            sample: *sample,
        });
    }

    fn on_pose(&mut self, object: &str, pose: &TimedPose) {
        self.send(ReportEvent::Pose {
            object: object.to_string(),
            pose: *pose,
        });
    }

    fn on_button(&mut self, object: &str, button: &ButtonEvent) {
        self.send(ReportEvent::Button {
            object: object.to_string(),
            button: *button,
        });
    }

    fn on_lighthouse(&mut self, object: &str, info: &LighthouseInfo) {
        self.send(ReportEvent::Lighthouse {
            object: object.to_string(),
            info: info.clone(),
        });
    }

    fn on_config(&mut self, object: &str, device: &DeviceAnnouncement) {
        self.send(ReportEvent::Config {
            object: object.to_string(),
            device: device.clone(),
        });
    }

    fn on_calibration(&mut self, object: &str, status: CalibrationStatus) {
        self.send(ReportEvent::Calibration {
            object: object.to_string(),
            status,
        });
    }

    fn on_message(&mut self, object: &str, message: &Message) {
        self.send(ReportEvent::Message {
            object: object.to_string(),
            message: message.clone(),
        });
    }
}

/// Receiving end of a [`ChannelReporter`].
pub struct EventStream {
    receiver: Receiver<ReportEvent>,
    active: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Receive the next event (blocks until available).
    pub fn recv(&self) -> Result<ReportEvent> {
        self.receiver.recv().map_err(|_| TrackerError::StreamStopped)
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<ReportEvent> {
        self.receiver.try_recv().ok()
    }

    /// Receive an event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ReportEvent> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => TrackerError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => TrackerError::StreamStopped,
        })
    }

    /// Whether the reporting side is still attached to a session.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Events dropped because this stream was not drained fast enough.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<ReportEvent> {
        self.receiver.try_iter().collect()
    }
}
