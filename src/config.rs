//! Session configuration, its argument-list form and the persisted calibration file.

use crate::calibration::CalibrationConfig;
use crate::disambiguator::DisambiguatorKind;
use crate::fusion::{FusionConfig, FusionMode};
use crate::ootx::LighthouseCalibration;
use crate::poser::{SolverKind, SolverOptions};
use crate::types::{LighthouseId, ObjectId, Pose};
use crate::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Most lighthouses a session addresses.
pub const MAX_LIGHTHOUSES: u8 = 16;

/// Tri-state option: `Default` leaves the built-in behavior alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Toggle {
    #[default]
    Default,
    No,
    Yes,
}

impl Toggle {
    pub fn resolve(self, builtin: bool) -> bool {
        match self {
            Toggle::Default => builtin,
            Toggle::No => false,
            Toggle::Yes => true,
        }
    }

    /// Whether the toggle changes the built-in behavior. An explicit value
    /// equal to the built-in does not, so it is dropped from the argument form.
    fn overrides(self, builtin: bool) -> bool {
        self != Toggle::Default && self.resolve(builtin) != builtin
    }

    fn flag_value(self) -> &'static str {
        if self == Toggle::Yes {
            "1"
        } else {
            "0"
        }
    }

    fn parse(value: &str) -> Option<Toggle> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(Toggle::Yes),
            "0" | "false" | "no" | "off" => Some(Toggle::No),
            _ => None,
        }
    }
}

impl From<bool> for Toggle {
    fn from(value: bool) -> Self {
        if value {
            Toggle::Yes
        } else {
            Toggle::No
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoserKind {
    #[default]
    Default,
    Dummy,
    CharlesSlow,
    CharlesRefine,
    DaveOrtho,
    Epnp,
    Sba,
    Mpfit,
    TurveyTori,
    OctavioRadii,
}

impl PoserKind {
    pub const ALL: [PoserKind; 10] = [
        PoserKind::Default,
        PoserKind::Dummy,
        PoserKind::CharlesSlow,
        PoserKind::CharlesRefine,
        PoserKind::DaveOrtho,
        PoserKind::Epnp,
        PoserKind::Sba,
        PoserKind::Mpfit,
        PoserKind::TurveyTori,
        PoserKind::OctavioRadii,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PoserKind::Default => "Default",
            PoserKind::Dummy => "Dummy",
            PoserKind::CharlesSlow => "CharlesSlow",
            PoserKind::CharlesRefine => "CharlesRefine",
            PoserKind::DaveOrtho => "DaveOrtho",
            PoserKind::Epnp => "EPNP",
            PoserKind::Sba => "SBA",
            PoserKind::Mpfit => "MPFIT",
            PoserKind::TurveyTori => "TurveyTori",
            PoserKind::OctavioRadii => "OctavioRadii",
        }
    }

    pub fn from_name(name: &str) -> Option<PoserKind> {
        PoserKind::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Solver behind this name, or `None` for names this crate does not implement.
    pub fn solver(self) -> Option<SolverKind> {
        match self {
            PoserKind::Default | PoserKind::Epnp => Some(SolverKind::Epnp),
            PoserKind::DaveOrtho => Some(SolverKind::Orthographic),
            PoserKind::Sba => Some(SolverKind::BundleAdjustment),
            PoserKind::Mpfit => Some(SolverKind::LeastSquares),
            PoserKind::CharlesRefine => Some(SolverKind::CulledRefine),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisambiguatorChoice {
    #[default]
    Default,
    /// Fast heuristic.
    Charles,
    /// Robust iterative.
    Turvey,
    StateBased,
}

impl DisambiguatorChoice {
    pub fn name(self) -> &'static str {
        match self {
            DisambiguatorChoice::Default => "Default",
            DisambiguatorChoice::Charles => "Charles",
            DisambiguatorChoice::Turvey => "Turvey",
            DisambiguatorChoice::StateBased => "StateBased",
        }
    }

    pub fn from_name(name: &str) -> Option<DisambiguatorChoice> {
        [
            DisambiguatorChoice::Default,
            DisambiguatorChoice::Charles,
            DisambiguatorChoice::Turvey,
            DisambiguatorChoice::StateBased,
        ]
        .into_iter()
        .find(|d| d.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn kind(self) -> DisambiguatorKind {
        match self {
            DisambiguatorChoice::Charles => DisambiguatorKind::FastHeuristic,
            DisambiguatorChoice::Turvey => DisambiguatorKind::RobustIterative,
            DisambiguatorChoice::Default | DisambiguatorChoice::StateBased => DisambiguatorKind::StateBased,
        }
    }
}

/// Built-in values the toggles fall back to.
pub mod builtin {
    pub const FORCE_CALIBRATE: bool = false;
    pub const DISABLE_CALIBRATE: bool = false;
    pub const USE_IMU: bool = false;
    pub const USE_KALMAN: bool = false;
    pub const USE_JACOBIAN: bool = true;
    pub const REPORT_IN_IMU: bool = false;
    pub const OOTX_IGNORE_SYNC_ERROR: bool = false;
    pub const ALLOW_ALL_TRACKERS: bool = false;
    pub const LIGHTHOUSE_COUNT: u8 = 2;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// JSON file holding lighthouse poses and OOTX data between sessions.
    pub config_file: Option<PathBuf>,
    pub playback_file: Option<PathBuf>,
    /// Replay speed: 1 is real time, 0 is as fast as possible.
    pub playback_factor: f64,
    /// Bodies allowed to calibrate. Empty means any.
    pub required_trackers: Vec<String>,
    pub allow_all_trackers: Toggle,
    pub lighthouse_count: Option<u8>,
    pub disable_lighthouse: Option<LighthouseId>,
    pub disambiguator: DisambiguatorChoice,
    pub poser: PoserKind,
    pub config_poser: PoserKind,
    pub seed_poser: PoserKind,
    pub force_calibrate: Toggle,
    pub disable_calibrate: Toggle,
    pub use_imu: Toggle,
    pub use_kalman: Toggle,
    pub use_jacobian: Toggle,
    pub report_in_imu: Toggle,
    pub ootx_ignore_sync_error: Toggle,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            playback_file: None,
            playback_factor: 1.0,
            required_trackers: Vec::new(),
            allow_all_trackers: Toggle::Default,
            lighthouse_count: None,
            disable_lighthouse: None,
            disambiguator: DisambiguatorChoice::Default,
            poser: PoserKind::Default,
            config_poser: PoserKind::Default,
            seed_poser: PoserKind::Default,
            force_calibrate: Toggle::Default,
            disable_calibrate: Toggle::Default,
            use_imu: Toggle::Default,
            use_kalman: Toggle::Default,
            use_jacobian: Toggle::Default,
            report_in_imu: Toggle::Default,
            ootx_ignore_sync_error: Toggle::Default,
        }
    }
}

fn invalid(message: impl Into<String>) -> TrackerError {
    TrackerError::InvalidConfig(message.into())
}

impl TrackerConfig {
    /// Bundle adjustment with a forced calibration and no IMU.
    pub fn standard() -> TrackerConfig {
        TrackerConfig {
            poser: PoserKind::Sba,
            force_calibrate: Toggle::Yes,
            use_imu: Toggle::No,
            ..TrackerConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(count) = self.lighthouse_count {
            if count == 0 || count > MAX_LIGHTHOUSES {
                return Err(invalid(format!(
                    "lighthouse count {} outside 1..={}",
                    count, MAX_LIGHTHOUSES
                )));
            }
        }
        if let Some(disabled) = self.disable_lighthouse {
            if disabled >= self.lighthouse_count() {
                return Err(invalid(format!(
                    "disabled lighthouse {} not below lighthouse count {}",
                    disabled,
                    self.lighthouse_count()
                )));
            }
        }
        if !self.playback_factor.is_finite() || self.playback_factor < 0.0 {
            return Err(invalid(format!("playback factor {} must be >= 0", self.playback_factor)));
        }
        for (role, poser) in [
            ("default", self.poser),
            ("calibration", self.config_poser),
            ("seed", self.seed_poser),
        ] {
            if poser.solver().is_none() {
                return Err(invalid(format!("{} poser {} is not supported", role, poser.name())));
            }
        }
        if self.seed_poser.solver().is_some_and(SolverKind::requires_seed) {
            return Err(invalid(format!(
                "seed poser {} needs a seed itself",
                self.seed_poser.name()
            )));
        }
        if let Some(bad) = self.required_trackers.iter().find(|t| ObjectId::from_name(t).is_none()) {
            return Err(invalid(format!("tracker name {:?} is not a valid codename", bad)));
        }
        Ok(())
    }

    pub fn lighthouse_count(&self) -> u8 {
        self.lighthouse_count.unwrap_or(builtin::LIGHTHOUSE_COUNT)
    }

    pub fn fusion_mode(&self) -> FusionMode {
        if !self.use_imu.resolve(builtin::USE_IMU) {
            FusionMode::PassThrough
        } else if self.use_kalman.resolve(builtin::USE_KALMAN) {
            FusionMode::Kalman
        } else {
            FusionMode::Complementary
        }
    }

    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            mode: self.fusion_mode(),
            report_in_imu: self.report_in_imu.resolve(builtin::REPORT_IN_IMU),
            ..FusionConfig::default()
        }
    }

    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            use_jacobian: self.use_jacobian.resolve(builtin::USE_JACOBIAN),
            ..SolverOptions::default()
        }
    }

    /// Tracking solver. `validate` guarantees the names map to solvers.
    pub fn default_solver(&self) -> SolverKind {
        self.poser.solver().unwrap_or(SolverKind::Epnp)
    }

    pub fn seed_solver(&self) -> SolverKind {
        self.seed_poser
            .solver()
            .filter(|s| !s.requires_seed())
            .unwrap_or(SolverKind::Epnp)
    }

    pub fn calibration_solver(&self) -> SolverKind {
        self.config_poser.solver().unwrap_or(SolverKind::Epnp)
    }

    pub fn ootx_tolerant(&self) -> bool {
        self.ootx_ignore_sync_error.resolve(builtin::OOTX_IGNORE_SYNC_ERROR)
    }

    pub fn force_calibrate(&self) -> bool {
        self.force_calibrate.resolve(builtin::FORCE_CALIBRATE)
    }

    /// Calibration is disabled only when asked and not also forced.
    pub fn calibration_disabled(&self) -> bool {
        self.disable_calibrate.resolve(builtin::DISABLE_CALIBRATE) && !self.force_calibrate()
    }

    pub fn calibration_config(&self) -> CalibrationConfig {
        let enabled = self.lighthouse_count() - u8::from(self.disable_lighthouse.is_some());
        CalibrationConfig {
            required_lighthouses: usize::from(enabled.max(1)),
            required_trackers: self.required_trackers.clone(),
            allow_all_trackers: self.allow_all_trackers.resolve(builtin::ALLOW_ALL_TRACKERS),
            disabled: self.calibration_disabled(),
            solver: self.calibration_solver(),
            seed_solver: Some(self.seed_solver()),
            solver_options: self.solver_options(),
            ..CalibrationConfig::default()
        }
    }

    /// Argument-list form. Toggles appear only when they change the built-in behavior.
    ///
    /// The round trip keeps behavior, not spelling: an explicit `No` for a
    /// built-in that is off comes back as `Default`, which resolves the same.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };

        if let Some(path) = &self.playback_file {
            push("--playback", path.display().to_string());
            push("--playback-factor", self.playback_factor.to_string());
        }
        if self.disambiguator != DisambiguatorChoice::Default {
            push("--disambiguator", self.disambiguator.name().to_string());
        }
        if self.force_calibrate.overrides(builtin::FORCE_CALIBRATE) {
            push("--force-calibrate", self.force_calibrate.flag_value().to_string());
        }
        let toggles = [
            ("--use-kalman", self.use_kalman, builtin::USE_KALMAN),
            ("--use-jacobian-function", self.use_jacobian, builtin::USE_JACOBIAN),
            ("--use-imu", self.use_imu, builtin::USE_IMU),
            ("--report-in-imu", self.report_in_imu, builtin::REPORT_IN_IMU),
        ];
        for (flag, toggle, default) in toggles {
            if toggle.overrides(default) {
                push(flag, toggle.flag_value().to_string());
            }
        }
        if self.poser != PoserKind::Default {
            push("--defaultposer", self.poser.name().to_string());
        }
        if self.seed_poser != PoserKind::Default {
            push("--seed-poser", self.seed_poser.name().to_string());
        }
        if self.config_poser != PoserKind::Default {
            push("--configposer", self.config_poser.name().to_string());
        }
        if self.ootx_ignore_sync_error.overrides(builtin::OOTX_IGNORE_SYNC_ERROR) {
            push("--ootx-ignore-sync-error", self.ootx_ignore_sync_error.flag_value().to_string());
        }
        if self.allow_all_trackers.overrides(builtin::ALLOW_ALL_TRACKERS) {
            push("--allowalltrackersforcal", self.allow_all_trackers.flag_value().to_string());
        }
        if !self.required_trackers.is_empty() {
            push("--requiredtrackersforcal", self.required_trackers.join(","));
        }
        if let Some(count) = self.lighthouse_count {
            push("--lighthouse-count", count.to_string());
        }
        if let Some(disabled) = self.disable_lighthouse {
            push("--disable-lighthouse", disabled.to_string());
        }
        if let Some(path) = &self.config_file {
            push("-c", path.display().to_string());
        }
        if self.calibration_disabled() {
            args.push("--disable-calibrate".to_string());
        }
        args
    }

    /// Parse the argument-list form produced by [`to_args`](Self::to_args).
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<TrackerConfig> {
        let mut config = TrackerConfig::default();
        let mut iter = args.iter().map(|a| a.as_ref());
        while let Some(flag) = iter.next() {
            if flag == "--disable-calibrate" {
                config.disable_calibrate = Toggle::Yes;
                continue;
            }
            let value = iter
                .next()
                .ok_or_else(|| invalid(format!("{} needs a value", flag)))?;
            let toggle = || Toggle::parse(value).ok_or_else(|| invalid(format!("{} expects 0 or 1, got {:?}", flag, value)));
            let poser = || PoserKind::from_name(value).ok_or_else(|| invalid(format!("unknown poser {:?}", value)));
            let number = |what: &str| {
                value
                    .parse::<u8>()
                    .map_err(|_| invalid(format!("{} expects a {}, got {:?}", flag, what, value)))
            };
            match flag {
                "--playback" => config.playback_file = Some(PathBuf::from(value)),
                "--playback-factor" => {
                    config.playback_factor = value
                        .parse()
                        .map_err(|_| invalid(format!("bad playback factor {:?}", value)))?
                }
                "--disambiguator" => {
                    config.disambiguator = DisambiguatorChoice::from_name(value)
                        .ok_or_else(|| invalid(format!("unknown disambiguator {:?}", value)))?
                }
                "--force-calibrate" => config.force_calibrate = toggle()?,
                "--use-kalman" => config.use_kalman = toggle()?,
                "--use-jacobian-function" => config.use_jacobian = toggle()?,
                "--use-imu" => config.use_imu = toggle()?,
                "--report-in-imu" => config.report_in_imu = toggle()?,
                "--ootx-ignore-sync-error" => config.ootx_ignore_sync_error = toggle()?,
                "--allowalltrackersforcal" => config.allow_all_trackers = toggle()?,
                "--defaultposer" => config.poser = poser()?,
                "--seed-poser" => config.seed_poser = poser()?,
                "--configposer" => config.config_poser = poser()?,
                "--requiredtrackersforcal" => {
                    config.required_trackers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "--lighthouse-count" => config.lighthouse_count = Some(number("count")?),
                "--disable-lighthouse" => config.disable_lighthouse = Some(number("lighthouse index")?),
                "-c" => config.config_file = Some(PathBuf::from(value)),
                other => return Err(invalid(format!("unknown option {:?}", other))),
            }
        }
        Ok(config)
    }

    /// Apply `LIGHTSWEEP_*` environment overrides.
    pub fn with_env_overrides(mut self) -> TrackerConfig {
        if let Some(v) = read_env_toggle("LIGHTSWEEP_FORCE_CALIBRATE") {
            self.force_calibrate = v;
        }
        if let Some(v) = read_env_toggle("LIGHTSWEEP_DISABLE_CALIBRATE") {
            self.disable_calibrate = v;
        }
        if let Some(v) = read_env_toggle("LIGHTSWEEP_USE_IMU") {
            self.use_imu = v;
        }
        if let Some(v) = read_env_toggle("LIGHTSWEEP_USE_KALMAN") {
            self.use_kalman = v;
        }
        if let Some(v) = read_env_toggle("LIGHTSWEEP_USE_JACOBIAN") {
            self.use_jacobian = v;
        }
        if let Some(v) = read_env_toggle("LIGHTSWEEP_REPORT_IN_IMU") {
            self.report_in_imu = v;
        }
        if let Some(v) = read_env_toggle("LIGHTSWEEP_OOTX_IGNORE_SYNC_ERROR") {
            self.ootx_ignore_sync_error = v;
        }
        if let Some(v) = read_env_u8("LIGHTSWEEP_LIGHTHOUSE_COUNT") {
            self.lighthouse_count = Some(v);
        }
        if let Some(v) = read_env_u8("LIGHTSWEEP_DISABLE_LIGHTHOUSE") {
            self.disable_lighthouse = Some(v);
        }
        if let Some(p) = read_env_string("LIGHTSWEEP_POSER").and_then(|v| PoserKind::from_name(&v)) {
            self.poser = p;
        }
        if let Some(d) = read_env_string("LIGHTSWEEP_DISAMBIGUATOR").and_then(|v| DisambiguatorChoice::from_name(&v)) {
            self.disambiguator = d;
        }
        if let Some(path) = read_env_string("LIGHTSWEEP_PLAYBACK") {
            self.playback_file = Some(PathBuf::from(path));
        }
        if let Some(factor) = read_env_string("LIGHTSWEEP_PLAYBACK_FACTOR").and_then(|v| v.parse().ok()) {
            self.playback_factor = factor;
        }
        self
    }
}

fn read_env_toggle(name: &str) -> Option<Toggle> {
    std::env::var(name).ok().and_then(|v| Toggle::parse(&v))
}

fn read_env_u8(name: &str) -> Option<u8> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// One lighthouse as stored in the calibration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLighthouse {
    pub pose: Pose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<LighthouseCalibration>,
}

/// Lighthouse poses and OOTX data kept between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStore {
    #[serde(default)]
    pub lighthouses: BTreeMap<LighthouseId, StoredLighthouse>,
}

impl CalibrationStore {
    pub fn load(path: &Path) -> Result<CalibrationStore> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load the file, or start empty when it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<CalibrationStore> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No calibration file at {}, starting fresh", path.display());
                Ok(CalibrationStore::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        log::info!("Saved calibration for {} lighthouses to {}", self.lighthouses.len(), path.display());
        Ok(())
    }

    /// Whether every lighthouse in `0..count` (except `disabled`) has a pose.
    pub fn covers(&self, count: u8, disabled: Option<LighthouseId>) -> bool {
        (0..count)
            .filter(|lh| Some(*lh) != disabled)
            .all(|lh| self.lighthouses.contains_key(&lh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_standard_config_args() {
        let args = TrackerConfig::standard().to_args();
        assert!(has_pair(&args, "--defaultposer", "SBA"));
        assert!(has_pair(&args, "--force-calibrate", "1"));
        assert!(!args.iter().any(|a| a == "--use-imu"));
        assert!(!args.iter().any(|a| a == "--disable-calibrate"));
    }

    #[test]
    fn test_seed_poser_uses_its_own_name() {
        let config = TrackerConfig {
            poser: PoserKind::Sba,
            seed_poser: PoserKind::DaveOrtho,
            ..TrackerConfig::default()
        };
        let args = config.to_args();
        assert!(has_pair(&args, "--seed-poser", "DaveOrtho"));
    }

    #[test]
    fn test_disable_calibrate_suppressed_by_force() {
        let mut config = TrackerConfig {
            disable_calibrate: Toggle::Yes,
            ..TrackerConfig::default()
        };
        assert!(config.to_args().iter().any(|a| a == "--disable-calibrate"));
        config.force_calibrate = Toggle::Yes;
        assert!(!config.to_args().iter().any(|a| a == "--disable-calibrate"));
        assert!(!config.calibration_disabled());
    }

    #[test]
    fn test_args_round_trip() {
        let config = TrackerConfig {
            playback_file: Some(PathBuf::from("session.rec")),
            playback_factor: 0.0,
            required_trackers: vec!["WM0".into(), "TR1".into()],
            lighthouse_count: Some(3),
            disable_lighthouse: Some(2),
            disambiguator: DisambiguatorChoice::Turvey,
            poser: PoserKind::Mpfit,
            config_poser: PoserKind::Epnp,
            seed_poser: PoserKind::DaveOrtho,
            use_imu: Toggle::Yes,
            use_kalman: Toggle::Yes,
            use_jacobian: Toggle::No,
            ootx_ignore_sync_error: Toggle::Yes,
            config_file: Some(PathBuf::from("calib.json")),
            ..TrackerConfig::default()
        };
        let parsed = TrackerConfig::from_args(&config.to_args()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_from_args_rejects_unknown() {
        assert!(TrackerConfig::from_args(&["--bogus", "1"]).is_err());
        assert!(TrackerConfig::from_args(&["--use-imu"]).is_err());
        assert!(TrackerConfig::from_args(&["--use-imu", "maybe"]).is_err());
    }

    #[test]
    fn test_explicit_builtin_toggle_round_trips_as_default() {
        let config = TrackerConfig {
            use_imu: Toggle::No,
            use_jacobian: Toggle::Yes,
            ..TrackerConfig::default()
        };
        assert!(config.to_args().is_empty());
        let back = TrackerConfig::from_args(&config.to_args()).unwrap();
        assert_eq!(back.use_imu, Toggle::Default);
        assert_eq!(back.use_imu.resolve(builtin::USE_IMU), config.use_imu.resolve(builtin::USE_IMU));
        assert_eq!(back.fusion_mode(), config.fusion_mode());
    }

    #[test]
    fn test_charles_refine_is_culled_least_squares() {
        assert_eq!(PoserKind::CharlesRefine.solver(), Some(SolverKind::CulledRefine));
        let config = TrackerConfig {
            poser: PoserKind::CharlesRefine,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.default_solver(), SolverKind::CulledRefine);
        let seeded = TrackerConfig {
            seed_poser: PoserKind::CharlesRefine,
            ..TrackerConfig::default()
        };
        assert!(seeded.validate().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(TrackerConfig::default().validate().is_ok());
        assert!(TrackerConfig::standard().validate().is_ok());
        let bad = [
            TrackerConfig {
                lighthouse_count: Some(0),
                ..TrackerConfig::default()
            },
            TrackerConfig {
                lighthouse_count: Some(2),
                disable_lighthouse: Some(2),
                ..TrackerConfig::default()
            },
            TrackerConfig {
                playback_factor: -1.0,
                ..TrackerConfig::default()
            },
            TrackerConfig {
                poser: PoserKind::TurveyTori,
                ..TrackerConfig::default()
            },
            TrackerConfig {
                seed_poser: PoserKind::Sba,
                ..TrackerConfig::default()
            },
            TrackerConfig {
                required_trackers: vec!["not a name".into()],
                ..TrackerConfig::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(TrackerError::InvalidConfig(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_fusion_mode_resolution() {
        assert_eq!(TrackerConfig::default().fusion_mode(), FusionMode::PassThrough);
        let c = TrackerConfig {
            use_imu: Toggle::Yes,
            ..TrackerConfig::default()
        };
        assert_eq!(c.fusion_mode(), FusionMode::Complementary);
        let c = TrackerConfig {
            use_kalman: Toggle::Yes,
            ..c
        };
        assert_eq!(c.fusion_mode(), FusionMode::Kalman);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("LIGHTSWEEP_USE_KALMAN", "1");
        std::env::set_var("LIGHTSWEEP_POSER", "sba");
        std::env::set_var("LIGHTSWEEP_LIGHTHOUSE_COUNT", "not a number");
        let config = TrackerConfig::default().with_env_overrides();
        std::env::remove_var("LIGHTSWEEP_USE_KALMAN");
        std::env::remove_var("LIGHTSWEEP_POSER");
        std::env::remove_var("LIGHTSWEEP_LIGHTHOUSE_COUNT");
        assert_eq!(config.use_kalman, Toggle::Yes);
        assert_eq!(config.poser, PoserKind::Sba);
        assert_eq!(config.lighthouse_count, None);
    }

    #[test]
    fn test_calibration_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("lightsweep-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("calib.json");
        let mut store = CalibrationStore::default();
        store.lighthouses.insert(
            1,
            StoredLighthouse {
                pose: Pose::new([1.0, 2.0, 3.0], [0.9, 0.1, 0.0, 0.0]),
                calibration: None,
            },
        );
        store.save(&path).unwrap();
        let loaded = CalibrationStore::load(&path).unwrap();
        assert_eq!(loaded.lighthouses.len(), 1);
        let (dp, dr) = loaded.lighthouses[&1].pose.distance_to(&store.lighthouses[&1].pose);
        assert!(dp < 1e-12 && dr < 1e-9);
        assert!(loaded.covers(2, Some(0)));
        assert!(!loaded.covers(2, None));

        let missing = CalibrationStore::load_or_default(&dir.join("missing.json")).unwrap();
        assert!(missing.lighthouses.is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
