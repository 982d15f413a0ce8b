//! Recorded event logs: line format, writer and replay source.
//!
//! One event per line, fields separated by whitespace:
//!
//! ```text
//! L obj sensor axis timecode length lh timeinsweep
//! S obj lh timecode length
//! I obj timecode mask ax ay az gx gy gz mx my mz
//! B obj type button a1id a1val a2id a2val
//! C obj driver <json>
//! P obj timecode x y z qw qx qy qz
//! ```
//!
//! Lines starting with `#` are comments. `P` lines are recorded output and are
//! skipped on replay.

use crate::capture::{CaptureSource, PollStatus};
use crate::protocol::TIMEBASE_HZ;
use crate::queue::EventSink;
use crate::report::Reporter;
use crate::types::{
    ButtonEvent, DeviceAnnouncement, Event, ImuPresence, ImuSample, LightHit, ObjectId, Pose,
    SweepAxis, SyncPulse, TimedPose,
};
use crate::{Result, TrackerError};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// One parsed line.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Event(Event),
    Pose(TimedPose),
}

struct Fields<'a> {
    line: usize,
    parts: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn error(&self, message: impl Into<String>) -> TrackerError {
        TrackerError::PlaybackParse {
            line: self.line,
            message: message.into(),
        }
    }

    fn next_str(&mut self, what: &str) -> Result<&'a str> {
        self.parts
            .next()
            .ok_or_else(|| self.error(format!("missing {}", what)))
    }

    fn next<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let raw = self.next_str(what)?;
        raw.parse()
            .map_err(|_| self.error(format!("bad {} {:?}", what, raw)))
    }

    fn object(&mut self) -> Result<ObjectId> {
        let name = self.next_str("object")?;
        ObjectId::from_name(name).ok_or_else(|| self.error(format!("bad object name {:?}", name)))
    }

    fn vec3(&mut self, what: &str) -> Result<[f64; 3]> {
        Ok([self.next(what)?, self.next(what)?, self.next(what)?])
    }

    fn finish(mut self) -> Result<()> {
        match self.parts.next() {
            Some(extra) => Err(self.error(format!("unexpected trailing field {:?}", extra))),
            None => Ok(()),
        }
    }
}

/// Parse one line. `line` is 1-based and only used in errors.
pub fn parse_line(text: &str, line: usize) -> Result<Option<Record>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let mut f = Fields {
        line,
        parts: trimmed.split_whitespace(),
    };
    let tag = f.next_str("tag")?;
    let record = match tag {
        "L" => {
            let object = f.object()?;
            let sensor = f.next("sensor")?;
            let axis: u8 = f.next("axis")?;
            if axis > 1 {
                return Err(f.error(format!("axis {} not 0 or 1", axis)));
            }
            let timecode = f.next("timecode")?;
            let pulse_length = f.next("length")?;
            let lighthouse = f.next("lighthouse")?;
            let time_in_sweep = f.next("time in sweep")?;
            f.finish()?;
            Record::Event(Event::Light(LightHit {
                object,
                sensor,
                axis: SweepAxis::from_index(axis),
                time_in_sweep,
                timecode,
                pulse_length,
                lighthouse,
            }))
        }
        "S" => {
            let pulse = SyncPulse {
                object: f.object()?,
                lighthouse: f.next("lighthouse")?,
                timecode: f.next("timecode")?,
                pulse_length: f.next("length")?,
            };
            f.finish()?;
            Record::Event(Event::Sync(pulse))
        }
        "I" => {
            let object = f.object()?;
            let timecode = f.next("timecode")?;
            let mask: u8 = f.next("mask")?;
            let sample = ImuSample {
                object,
                timecode,
                presence: ImuPresence::from_bits_truncate(mask),
                accel: f.vec3("accel")?,
                gyro: f.vec3("gyro")?,
                mag: f.vec3("mag")?,
            };
            f.finish()?;
            Record::Event(Event::Imu(sample))
        }
        "B" => {
            let button = ButtonEvent {
                object: f.object()?,
                event_type: f.next("event type")?,
                button_id: f.next("button id")?,
                axis1_id: f.next("axis 1 id")?,
                axis1_val: f.next("axis 1 value")?,
                axis2_id: f.next("axis 2 id")?,
                axis2_val: f.next("axis 2 value")?,
            };
            f.finish()?;
            Record::Event(Event::Button(button))
        }
        "C" => {
            // The JSON blob runs to the end of the line and may contain spaces.
            let (object, rest) = split_field(trimmed)
                .and_then(|(_, rest)| split_field(rest))
                .ok_or_else(|| f.error("missing object"))?;
            let object =
                ObjectId::from_name(object).ok_or_else(|| f.error(format!("bad object name {:?}", object)))?;
            let (driver, config_json) = split_field(rest)
                .filter(|(_, json)| !json.is_empty())
                .ok_or_else(|| f.error("missing device json"))?;
            Record::Event(Event::Device(DeviceAnnouncement {
                object,
                driver: driver.to_string(),
                config_json: config_json.to_string(),
            }))
        }
        "P" => {
            let object = f.object()?;
            let timecode = f.next("timecode")?;
            let position = f.vec3("position")?;
            let rotation = [
                f.next("qw")?,
                f.next("qx")?,
                f.next("qy")?,
                f.next("qz")?,
            ];
            f.finish()?;
            Record::Pose(TimedPose {
                object,
                timecode,
                pose: Pose::new(position, rotation),
            })
        }
        other => return Err(f.error(format!("unknown record tag {:?}", other))),
    };
    Ok(Some(record))
}

/// First whitespace-separated field and the trimmed remainder.
fn split_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    let end = s.find(char::is_whitespace)?;
    Some((&s[..end], s[end..].trim()))
}

fn join3(v: &[f64; 3]) -> String {
    format!("{} {} {}", v[0], v[1], v[2])
}

/// Log line for an event. Status events have no line form.
pub fn format_event(event: &Event) -> Option<String> {
    let line = match event {
        Event::Light(h) => format!(
            "L {} {} {} {} {} {} {}",
            h.object,
            h.sensor,
            h.axis.index(),
            h.timecode,
            h.pulse_length,
            h.lighthouse,
            h.time_in_sweep
        ),
        Event::Sync(s) => format!("S {} {} {} {}", s.object, s.lighthouse, s.timecode, s.pulse_length),
        Event::Imu(i) => format!(
            "I {} {} {} {} {} {}",
            i.object,
            i.timecode,
            i.presence.bits(),
            join3(&i.accel),
            join3(&i.gyro),
            join3(&i.mag)
        ),
        Event::Button(b) => format!(
            "B {} {} {} {} {} {} {}",
            b.object, b.event_type, b.button_id, b.axis1_id, b.axis1_val, b.axis2_id, b.axis2_val
        ),
        Event::Device(d) => {
            // Keep the blob on one line.
            let json = d.config_json.replace(['\n', '\r'], " ");
            format!("C {} {} {}", d.object, d.driver, json)
        }
        Event::Status { .. } => return None,
    };
    Some(line)
}

pub fn format_pose(pose: &TimedPose) -> String {
    let p = &pose.pose;
    format!(
        "P {} {} {} {} {} {} {}",
        pose.object,
        pose.timecode,
        join3(&p.position),
        p.rotation[0],
        p.rotation[1],
        p.rotation[2],
        p.rotation[3]
    )
}

/// Parse a whole log.
pub fn read_records<R: BufRead>(reader: R) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        if let Some(record) = parse_line(&line?, i + 1)? {
            out.push(record);
        }
    }
    Ok(out)
}

/// Reporter that writes the session's input (and poses) in log format.
pub struct Recorder<W: Write + Send> {
    writer: W,
    lines: u64,
    failed: bool,
    record_poses: bool,
}

impl<W: Write + Send> Recorder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            lines: 0,
            failed: false,
            record_poses: true,
        }
    }

    /// Leave `P` lines out of the log.
    pub fn without_poses(mut self) -> Self {
        self.record_poses = false;
        self
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn into_inner(self) -> W {
        let mut writer = self.writer;
        let _ = writer.flush();
        writer
    }

    fn write_line(&mut self, line: &str) {
        if self.failed {
            return;
        }
        if let Err(e) = writeln!(self.writer, "{}", line) {
            log::warn!("Recorder write failed, recording stopped: {}", e);
            self.failed = true;
            return;
        }
        self.lines += 1;
    }

    fn write_event(&mut self, event: &Event) {
        if let Some(line) = format_event(event) {
            self.write_line(&line);
        }
    }
}

impl<W: Write + Send> Reporter for Recorder<W> {
    fn on_light(&mut self, _object: &str, hit: &LightHit) {
        self.write_event(&Event::Light(*hit));
    }

    fn on_sync(&mut self, _object: &str, pulse: &SyncPulse) {
        self.write_event(&Event::Sync(*pulse));
    }

    fn on_raw_imu(&mut self, _object: &str, sample: &ImuSample) {
        self.write_event(&Event::Imu(*sample));
    }

    fn on_button(&mut self, _object: &str, button: &ButtonEvent) {
        self.write_event(&Event::Button(*button));
    }

    fn on_config(&mut self, _object: &str, device: &DeviceAnnouncement) {
        self.write_event(&Event::Device(device.clone()));
    }

    fn on_pose(&mut self, _object: &str, pose: &TimedPose) {
        if self.record_poses {
            let line = format_pose(pose);
            self.write_line(&line);
        }
    }
}

/// Longest single sleep while pacing, so stop requests are seen promptly.
const PACING_SLICE: Duration = Duration::from_millis(10);
/// Events pushed per poll when replaying as fast as possible.
const BATCH: usize = 256;

/// [`CaptureSource`] replaying a recorded log.
///
/// `factor` scales recorded time: 1 replays in real time, 2 at half speed,
/// 0 as fast as the queue accepts.
pub struct PlaybackSource {
    name: String,
    lines: std::io::Lines<Box<dyn BufRead + Send>>,
    line: usize,
    factor: f64,
    timebase_hz: f64,
    pending: Option<Event>,
    clock: Option<(Instant, u64)>,
    replayed: u64,
    skipped_poses: u64,
}

impl PlaybackSource {
    pub fn open(path: &Path, factor: f64) -> Result<PlaybackSource> {
        let file = std::fs::File::open(path)?;
        log::info!("Replaying {} at factor {}", path.display(), factor);
        Ok(Self::from_reader(
            Box::new(BufReader::new(file)),
            factor,
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "playback".to_string()),
        ))
    }

    pub fn from_reader(reader: Box<dyn BufRead + Send>, factor: f64, name: String) -> PlaybackSource {
        PlaybackSource {
            name,
            lines: reader.lines(),
            line: 0,
            factor: factor.max(0.0),
            timebase_hz: TIMEBASE_HZ as f64,
            pending: None,
            clock: None,
            replayed: 0,
            skipped_poses: 0,
        }
    }

    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    fn next_event(&mut self) -> Result<Option<Event>> {
        if let Some(event) = self.pending.take() {
            return Ok(Some(event));
        }
        loop {
            let Some(text) = self.lines.next() else {
                return Ok(None);
            };
            self.line += 1;
            match parse_line(&text?, self.line)? {
                Some(Record::Event(event)) => return Ok(Some(event)),
                Some(Record::Pose(_)) => self.skipped_poses += 1,
                None => {}
            }
        }
    }

    /// Time left before `event` is due, if any.
    fn wait_for(&mut self, event: &Event) -> Option<Duration> {
        if self.factor == 0.0 {
            return None;
        }
        let timecode = event.timecode()?;
        let (start, first) = *self.clock.get_or_insert((Instant::now(), timecode));
        let offset = timecode.saturating_sub(first) as f64 / self.timebase_hz * self.factor;
        let due = start + Duration::from_secs_f64(offset);
        due.checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

impl CaptureSource for PlaybackSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, sink: &EventSink) -> Result<PollStatus> {
        for _ in 0..BATCH {
            let Some(event) = self.next_event()? else {
                log::info!(
                    "Playback of {} done: {} events, {} recorded poses skipped",
                    self.name,
                    self.replayed,
                    self.skipped_poses
                );
                return Ok(PollStatus::Finished);
            };
            if let Some(wait) = self.wait_for(&event) {
                self.pending = Some(event);
                std::thread::sleep(wait.min(PACING_SLICE));
                return Ok(PollStatus::Continue);
            }
            self.push(sink, event)?;
        }
        Ok(PollStatus::Continue)
    }
}

impl PlaybackSource {
    fn push(&mut self, sink: &EventSink, event: Event) -> Result<()> {
        // Replay is lossless: wait out a full light lane instead of dropping.
        let mut backoff = Duration::from_micros(50);
        loop {
            match sink.push(event.clone()) {
                Ok(()) => {
                    self.replayed += 1;
                    return Ok(());
                }
                Err(TrackerError::QueueOverflow(_)) => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(PACING_SLICE);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ingest_queue, QueueConfig};

    fn wm0() -> ObjectId {
        ObjectId::from_name("WM0").unwrap()
    }

    const LOG: &str = "\
# recorded session
S WM0 0 1000 3000
L WM0 4 0 5000 120 0 199000
I WM0 6000 3 0 0 1 0.1 0.2 0.3 0 0 0
B WM0 1 2 0 0 0 0
P WM0 7000 0.1 0.2 0.3 1 0 0 0
C WM0 Wand {\"modelPoints\": [[0, 0, 0]]}
";

    #[test]
    fn test_parse_log() {
        let records = read_records(LOG.as_bytes()).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(
            records[0],
            Record::Event(Event::Sync(SyncPulse {
                object: wm0(),
                lighthouse: 0,
                timecode: 1000,
                pulse_length: 3000,
            }))
        );
        match &records[1] {
            Record::Event(Event::Light(h)) => {
                assert_eq!(h.sensor, 4);
                assert_eq!(h.axis, SweepAxis::Horizontal);
                assert_eq!(h.time_in_sweep, 199_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &records[2] {
            Record::Event(Event::Imu(i)) => {
                assert_eq!(i.presence, ImuPresence::ACCEL | ImuPresence::GYRO);
                assert_eq!(i.gyro, [0.1, 0.2, 0.3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(records[4], Record::Pose(_)));
        match &records[5] {
            Record::Event(Event::Device(d)) => {
                assert_eq!(d.driver, "Wand");
                assert_eq!(d.config_json, "{\"modelPoints\": [[0, 0, 0]]}");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_reports_line() {
        let text = "# header\nS WM0 0 1000 3000\nL WM0 x 0 5000 120 0 199000\n";
        match read_records(text.as_bytes()) {
            Err(TrackerError::PlaybackParse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(parse_line("Q WM0", 1).is_err());
        assert!(parse_line("S WM0 0 1000 3000 extra", 1).is_err());
    }

    #[test]
    fn test_format_matches_parse() {
        for record in read_records(LOG.as_bytes()).unwrap() {
            let line = match &record {
                Record::Event(e) => format_event(e).unwrap(),
                Record::Pose(p) => format_pose(p),
            };
            assert_eq!(parse_line(&line, 1).unwrap(), Some(record));
        }
    }

    #[test]
    fn test_recorder_writes_log() {
        let mut recorder = Recorder::new(Vec::new());
        let pulse = SyncPulse {
            object: wm0(),
            lighthouse: 1,
            timecode: 10,
            pulse_length: 3500,
        };
        recorder.on_sync("WM0", &pulse);
        recorder.on_pose(
            "WM0",
            &TimedPose {
                object: wm0(),
                timecode: 11,
                pose: Pose::IDENTITY,
            },
        );
        assert_eq!(recorder.lines(), 2);
        let text = String::from_utf8(recorder.into_inner()).unwrap();
        let records = read_records(text.as_bytes()).unwrap();
        assert_eq!(records[0], Record::Event(Event::Sync(pulse)));
    }

    #[test]
    fn test_replay_skips_poses() {
        let (sink, mut drain) = ingest_queue(QueueConfig::default());
        let mut source = PlaybackSource::from_reader(Box::new(LOG.as_bytes()), 0.0, "test".into());
        assert_eq!(source.poll(&sink).unwrap(), PollStatus::Finished);
        assert_eq!(source.replayed(), 5);
        let events: Vec<Event> = drain.drain().collect();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], Event::Sync(_)));
    }

    #[test]
    fn test_paced_replay_waits() {
        let text = "S WM0 0 0 3000\nS WM0 0 480000 3000\n";
        let (sink, mut drain) = ingest_queue(QueueConfig::default());
        // 480000 ticks is 10 ms of recorded time.
        let mut source = PlaybackSource::from_reader(Box::new(text.as_bytes()), 1.0, "paced".into());
        let start = Instant::now();
        while source.poll(&sink).unwrap() == PollStatus::Continue {}
        assert!(start.elapsed() >= Duration::from_millis(9));
        assert_eq!(drain.drain().count(), 2);
    }
}
