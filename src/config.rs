use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_CONF_DRAW_TH: f32 = 0.7;
const DEFAULT_CONF_DETECT_TH: f32 = 0.5;

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_VIDEO_PORT: u16 = 5555;
const DEFAULT_CTRL_PORT: u16 = 5556;
const DEFAULT_RCV_TIMEOUT_MS: u64 = 2000;

const DEFAULT_HAND_EVERY_N: u32 = 3;
const DEFAULT_HAND_CONF_TH: f32 = 0.65;
const DEFAULT_EMERGENCY_HOLD_S: f64 = 5.0;
const MAX_EMERGENCY_HOLD_S: f64 = 3600.0;
const DEFAULT_PERSON_CLASS: &str = "person";
const DEFAULT_HAND_CLASS: &str = "Hand raise";

const DEFAULT_NOTIFY_QUEUE: usize = 8;

/// Top-level configuration for the follower daemon.
///
/// Every field is optional in the JSON file; missing values take the defaults
/// below. Layering is file → environment → validation.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FollowerConfig {
    pub video: VideoSettings,
    pub transport: TransportSettings,
    pub control: ControlSettings,
    pub emergency: EmergencySettings,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoSettings {
    /// Working resolution; received frames are resized to this.
    pub width: u32,
    pub height: u32,
    /// Minimum confidence for a class to appear in the seen-class list.
    pub conf_draw_th: f32,
    /// Confidence threshold passed to the primary detector.
    pub conf_detect_th: f32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            conf_draw_th: DEFAULT_CONF_DRAW_TH,
            conf_detect_th: DEFAULT_CONF_DETECT_TH,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub bind_host: String,
    pub video_port: u16,
    pub ctrl_port: u16,
    pub rcv_timeout_ms: u64,
}

impl TransportSettings {
    pub fn video_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.video_port)
    }

    pub fn ctrl_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.ctrl_port)
    }

    pub fn rcv_timeout(&self) -> Duration {
        Duration::from_millis(self.rcv_timeout_ms)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            video_port: DEFAULT_VIDEO_PORT,
            ctrl_port: DEFAULT_CTRL_PORT,
            rcv_timeout_ms: DEFAULT_RCV_TIMEOUT_MS,
        }
    }
}

/// Gains, deadbands and limits for the proportional follower.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlSettings {
    pub kp_ang: f64,
    pub kp_lin: f64,
    /// Target box area as a fraction of the frame area.
    pub desired_area: f64,
    pub area_deadband: f64,
    pub angular_deadzone: f64,
    pub max_linear: f64,
    pub max_angular: f64,
    /// Smallest non-zero linear command the drive actually responds to.
    pub min_move_linear: f64,
    /// Exponential filter weight on the previous command, in `[0, 1)`.
    pub smoothing: f64,
    pub search_linear: f64,
    pub search_angular: f64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            kp_ang: 0.3,
            kp_lin: 8.0,
            desired_area: 0.2,
            area_deadband: 0.05,
            angular_deadzone: 0.15,
            max_linear: 0.25,
            max_angular: 0.17,
            min_move_linear: 0.06,
            smoothing: 0.6,
            search_linear: 0.0,
            search_angular: 0.0,
        }
    }
}

/// Hand-raise emergency latch settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmergencySettings {
    pub enabled: bool,
    /// Run the secondary detector on every n-th eligible iteration.
    pub hand_every_n: u32,
    pub hand_conf_th: f32,
    pub emergency_hold_s: f64,
    pub person_class_name: String,
    pub hand_class_name: String,
}

impl EmergencySettings {
    /// The latch hold period. Must be positive and at most one hour.
    pub fn hold(&self) -> Result<Duration> {
        let secs = self.emergency_hold_s;
        if !(secs > 0.0 && secs <= MAX_EMERGENCY_HOLD_S) {
            return Err(anyhow!(
                "emergency_hold_s must be within (0, {}], got {}",
                MAX_EMERGENCY_HOLD_S,
                secs
            ));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| anyhow!("emergency_hold_s {} is not a valid duration: {}", secs, e))
    }
}

impl Default for EmergencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hand_every_n: DEFAULT_HAND_EVERY_N,
            hand_conf_th: DEFAULT_HAND_CONF_TH,
            emergency_hold_s: DEFAULT_EMERGENCY_HOLD_S,
            person_class_name: DEFAULT_PERSON_CLASS.to_string(),
            hand_class_name: DEFAULT_HAND_CLASS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifySettings {
    /// Speech command line, e.g. `espeak -s 175`. The text is appended as the
    /// final argument. Unset means speech is logged only.
    pub speech_command: Option<String>,
    pub speech_queue: usize,
    pub alert_queue: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            speech_command: None,
            speech_queue: DEFAULT_NOTIFY_QUEUE,
            alert_queue: DEFAULT_NOTIFY_QUEUE,
        }
    }
}

impl FollowerConfig {
    /// Load from `FOLLOWER_CONFIG` (if set), apply env overrides, validate.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var("FOLLOWER_CONFIG").ok().as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_parse("FOLLOWER_VIDEO_PORT")? {
            self.transport.video_port = port;
        }
        if let Some(port) = env_parse("FOLLOWER_CTRL_PORT")? {
            self.transport.ctrl_port = port;
        }
        if let Some(ms) = env_parse("FOLLOWER_RCV_TIMEOUT_MS")? {
            self.transport.rcv_timeout_ms = ms;
        }
        if let Some(host) = env_string("FOLLOWER_BIND_HOST") {
            self.transport.bind_host = host;
        }
        if let Some(class) = env_string("FOLLOWER_PERSON_CLASS") {
            self.emergency.person_class_name = class;
        }
        if let Some(class) = env_string("FOLLOWER_HAND_CLASS") {
            self.emergency.hand_class_name = class;
        }
        if let Some(hold) = env_parse("FOLLOWER_EMERGENCY_HOLD_S")? {
            self.emergency.emergency_hold_s = hold;
        }
        if let Some(command) = env_string("FOLLOWER_SPEECH_COMMAND") {
            self.notify.speech_command = Some(command);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(anyhow!("video width and height must be greater than zero"));
        }
        for (name, value) in [
            ("conf_draw_th", self.video.conf_draw_th),
            ("conf_detect_th", self.video.conf_detect_th),
            ("hand_conf_th", self.emergency.hand_conf_th),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.transport.rcv_timeout_ms == 0 {
            return Err(anyhow!("rcv_timeout_ms must be greater than zero"));
        }
        if self.transport.video_port == self.transport.ctrl_port {
            return Err(anyhow!(
                "video_port and ctrl_port must differ (both {})",
                self.transport.video_port
            ));
        }

        let c = &self.control;
        if !(0.0..1.0).contains(&c.smoothing) {
            return Err(anyhow!("smoothing must be within [0, 1), got {}", c.smoothing));
        }
        for (name, value) in [
            ("area_deadband", c.area_deadband),
            ("angular_deadzone", c.angular_deadzone),
            ("max_linear", c.max_linear),
            ("max_angular", c.max_angular),
            ("min_move_linear", c.min_move_linear),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("{} must be a non-negative number, got {}", name, value));
            }
        }
        if c.min_move_linear > c.max_linear {
            return Err(anyhow!(
                "min_move_linear ({}) must not exceed max_linear ({})",
                c.min_move_linear,
                c.max_linear
            ));
        }

        if self.emergency.hand_every_n == 0 {
            return Err(anyhow!("hand_every_n must be greater than zero"));
        }
        self.emergency.hold()?;
        if self.notify.speech_queue == 0 || self.notify.alert_queue == 0 {
            return Err(anyhow!("notification queue depth must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FollowerConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, raw)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = FollowerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.transport.video_addr(), "0.0.0.0:5555");
        assert_eq!(cfg.transport.rcv_timeout(), Duration::from_millis(2000));
        assert_eq!(cfg.emergency.hold().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = FollowerConfig::from_json(r#"{"control": {"kp_lin": 4.0}}"#).unwrap();
        assert_eq!(cfg.control.kp_lin, 4.0);
        assert_eq!(cfg.control.kp_ang, 0.3);
        assert_eq!(cfg.video.width, 640);
    }

    #[test]
    fn rejects_bad_smoothing_and_stride() {
        assert!(FollowerConfig::from_json(r#"{"control": {"smoothing": 1.0}}"#).is_err());
        assert!(FollowerConfig::from_json(r#"{"emergency": {"hand_every_n": 0}}"#).is_err());
        assert!(FollowerConfig::from_json(
            r#"{"control": {"min_move_linear": 0.5, "max_linear": 0.25}}"#
        )
        .is_err());
    }

    #[test]
    fn rejects_hold_that_cannot_latch() {
        for hold in ["0", "-1.0", "3600.5", "1e19", "1e20"] {
            let json = format!(r#"{{"emergency": {{"emergency_hold_s": {}}}}}"#, hold);
            let err = FollowerConfig::from_json(&json).unwrap_err();
            assert!(
                err.to_string().contains("emergency_hold_s"),
                "hold {} gave: {}",
                hold,
                err
            );
        }
        let cfg = FollowerConfig::from_json(r#"{"emergency": {"emergency_hold_s": 3600}}"#).unwrap();
        assert_eq!(cfg.emergency.hold().unwrap(), Duration::from_secs(3600));
    }
}
