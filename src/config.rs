use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NvrError;
use crate::media::Protocol;
use crate::prebuffer::BufferMode;

const DEFAULT_STORAGE_PATH: &str = "/var/lib/nvr";
const DEFAULT_MODELS_PATH: &str = "/var/lib/nvr/models";
const DEFAULT_MAX_STREAMS: usize = 16;
const DEFAULT_CONCURRENT_DETECTIONS: usize = 16;
const EMBEDDED_CONCURRENT_DETECTIONS: usize = 2;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MP4_SEGMENT_SECS: u64 = 900;
pub const DEFAULT_HLS_LIST_SIZE: usize = 5;

pub const DEFAULT_FPS: u32 = 15;
pub const DEFAULT_SEGMENT_DURATION: i32 = 2;
pub const DEFAULT_DETECT_INTERVAL: u32 = 10;
pub const DEFAULT_PRE_ROLL_SECS: u32 = 5;
pub const DEFAULT_POST_ROLL_SECS: u32 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_STREAM_NAME: usize = 63;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_CLIENT_ID: &str = "nvrd";
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "nvr";

#[derive(Debug, Deserialize, Default)]
struct NvrConfigFile {
    storage_path: Option<PathBuf>,
    mp4_storage_path: Option<PathBuf>,
    record_mp4_directly: Option<bool>,
    models_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    max_streams: Option<usize>,
    concurrent_detections: Option<usize>,
    embedded: Option<bool>,
    shutdown_timeout_secs: Option<u64>,
    prebuffer_mode: Option<BufferMode>,
    mp4_segment_duration: Option<u64>,
    hls_list_size: Option<usize>,
    api_detection_url: Option<String>,
    mqtt: Option<MqttConfigFile>,
    streams: Option<Vec<StreamConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    name: Option<String>,
    url: Option<String>,
    protocol: Option<Protocol>,
    codec: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    segment_duration: Option<i32>,
    record: Option<bool>,
    detect_enabled: Option<bool>,
    detect_model: Option<String>,
    detect_threshold: Option<f32>,
    detect_interval: Option<u32>,
    pre_roll_seconds: Option<u32>,
    post_roll_seconds: Option<u32>,
    priority: Option<u8>,
    streaming_enabled: Option<bool>,
    audio_enabled: Option<bool>,
}

/// Desired state of one ingest. Snapshotted into the stream state on add.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    pub protocol: Protocol,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Seconds per HLS segment. Non-positive values fall back to 2.
    pub segment_duration: i32,
    pub record: bool,
    pub detect_enabled: bool,
    pub detect_model: String,
    /// 0.0 means "use the model's default".
    pub detect_threshold: f32,
    /// Seconds between detections.
    pub detect_interval: u32,
    pub pre_roll_seconds: u32,
    pub post_roll_seconds: u32,
    pub priority: u8,
    pub streaming_enabled: bool,
    pub audio_enabled: bool,
}

impl StreamConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            protocol: Protocol::Tcp,
            codec: "h264".to_string(),
            width: 0,
            height: 0,
            fps: DEFAULT_FPS,
            segment_duration: DEFAULT_SEGMENT_DURATION,
            record: false,
            detect_enabled: false,
            detect_model: String::new(),
            detect_threshold: 0.0,
            detect_interval: DEFAULT_DETECT_INTERVAL,
            pre_roll_seconds: DEFAULT_PRE_ROLL_SECS,
            post_roll_seconds: DEFAULT_POST_ROLL_SECS,
            priority: DEFAULT_PRIORITY,
            streaming_enabled: true,
            audio_enabled: true,
        }
    }

    fn from_file(file: StreamConfigFile) -> Result<Self> {
        let name = file
            .name
            .ok_or_else(|| NvrError::config("stream entry without a name"))?;
        let url = file.url.unwrap_or_default();
        let mut cfg = Self::new(&name, &url);
        if let Some(protocol) = file.protocol {
            cfg.protocol = protocol;
        }
        if let Some(codec) = file.codec {
            cfg.codec = codec.to_lowercase();
        }
        cfg.width = file.width.unwrap_or(0);
        cfg.height = file.height.unwrap_or(0);
        cfg.fps = file.fps.unwrap_or(DEFAULT_FPS);
        cfg.segment_duration = file.segment_duration.unwrap_or(DEFAULT_SEGMENT_DURATION);
        cfg.record = file.record.unwrap_or(false);
        cfg.detect_enabled = file.detect_enabled.unwrap_or(false);
        cfg.detect_model = file.detect_model.unwrap_or_default();
        cfg.detect_threshold = file.detect_threshold.unwrap_or(0.0);
        cfg.detect_interval = file.detect_interval.unwrap_or(DEFAULT_DETECT_INTERVAL);
        cfg.pre_roll_seconds = file.pre_roll_seconds.unwrap_or(DEFAULT_PRE_ROLL_SECS);
        cfg.post_roll_seconds = file.post_roll_seconds.unwrap_or(DEFAULT_POST_ROLL_SECS);
        cfg.priority = file.priority.unwrap_or(DEFAULT_PRIORITY);
        cfg.streaming_enabled = file.streaming_enabled.unwrap_or(true);
        cfg.audio_enabled = file.audio_enabled.unwrap_or(true);
        Ok(cfg)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_detection(mut self, model: &str, interval: u32) -> Self {
        self.detect_enabled = true;
        self.detect_model = model.to_string();
        self.detect_interval = interval;
        self
    }

    pub fn with_recording(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// True when a detection model is configured and enabled.
    pub fn wants_detection(&self) -> bool {
        self.detect_enabled && !self.detect_model.trim().is_empty()
    }

    /// Field-level checks that do not depend on other streams.
    pub fn validate(&self) -> Result<()> {
        validate_stream_name(&self.name)?;
        if self.url.trim().is_empty() {
            return Err(NvrError::config(format!("stream {} has an empty url", self.name)));
        }
        if self.priority > 100 {
            return Err(NvrError::config(format!(
                "stream {} priority {} is outside 0-100",
                self.name, self.priority
            )));
        }
        if self.detect_enabled && self.detect_model.trim().is_empty() {
            return Err(NvrError::config(format!(
                "stream {} enables detection without a model",
                self.name
            )));
        }
        Ok(())
    }
}

pub fn validate_stream_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z0-9_.-]{1,63}$")
        .map_err(|e| anyhow!("stream name pattern: {}", e))?;
    if !re.is_match(name) || name.len() > MAX_STREAM_NAME {
        return Err(NvrError::config(format!(
            "invalid stream name '{}': expected 1-{} of [A-Za-z0-9_.-]",
            name, MAX_STREAM_NAME
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NvrConfig {
    pub storage_path: PathBuf,
    pub mp4_storage_path: Option<PathBuf>,
    pub record_mp4_directly: bool,
    pub models_path: PathBuf,
    pub db_path: Option<PathBuf>,
    pub max_streams: usize,
    pub concurrent_detections: usize,
    pub shutdown_timeout: Duration,
    pub prebuffer_mode: BufferMode,
    pub mp4_segment_duration: Duration,
    pub hls_list_size: usize,
    /// Endpoint behind the `api-detection` model string.
    pub api_detection_url: Option<String>,
    pub mqtt: Option<MqttSettings>,
    pub streams: Vec<StreamConfig>,
}

impl Default for NvrConfig {
    fn default() -> Self {
        Self::from_globals(NvrConfigFile::default())
    }
}

impl NvrConfig {
    /// File named by `NVR_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("NVR_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => NvrConfigFile::default(),
        };
        let mut cfg = Self::build(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Configuration rooted at `storage`, everything else default. Used by tests
    /// and embedders that build streams programmatically.
    pub fn with_storage(storage: &Path) -> Self {
        let mut cfg = Self::default();
        cfg.storage_path = storage.to_path_buf();
        cfg.models_path = storage.join("models");
        cfg
    }

    fn build(mut file: NvrConfigFile) -> Result<Self> {
        let streams = file
            .streams
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(StreamConfig::from_file)
            .collect::<Result<Vec<_>>>()?;
        let mut cfg = Self::from_globals(file);
        cfg.streams = streams;
        Ok(cfg)
    }

    fn from_globals(file: NvrConfigFile) -> Self {
        let storage_path = file
            .storage_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH));
        let models_path = file
            .models_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_PATH));
        let embedded = file.embedded.unwrap_or(cfg!(feature = "embedded"));
        let concurrent_detections = file.concurrent_detections.unwrap_or(if embedded {
            EMBEDDED_CONCURRENT_DETECTIONS
        } else {
            DEFAULT_CONCURRENT_DETECTIONS
        });
        let mqtt = file.mqtt.map(|mqtt| MqttSettings {
            host: mqtt.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: mqtt.port.unwrap_or(DEFAULT_MQTT_PORT),
            client_id: mqtt
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            topic_prefix: mqtt
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            username: mqtt.username,
            password: mqtt.password,
        });
        Self {
            storage_path,
            mp4_storage_path: file.mp4_storage_path,
            record_mp4_directly: file.record_mp4_directly.unwrap_or(false),
            models_path,
            db_path: file.db_path,
            max_streams: file.max_streams.unwrap_or(DEFAULT_MAX_STREAMS),
            concurrent_detections,
            shutdown_timeout: Duration::from_secs(
                file.shutdown_timeout_secs
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
            prebuffer_mode: file.prebuffer_mode.unwrap_or_default(),
            mp4_segment_duration: Duration::from_secs(
                file.mp4_segment_duration.unwrap_or(DEFAULT_MP4_SEGMENT_SECS),
            ),
            hls_list_size: file.hls_list_size.unwrap_or(DEFAULT_HLS_LIST_SIZE),
            api_detection_url: file.api_detection_url,
            mqtt,
            streams: Vec::new(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("NVR_STORAGE_PATH") {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("NVR_MP4_STORAGE_PATH") {
            self.mp4_storage_path = Some(PathBuf::from(path));
        }
        if let Some(value) = env_nonempty("NVR_RECORD_MP4_DIRECTLY") {
            self.record_mp4_directly = parse_bool("NVR_RECORD_MP4_DIRECTLY", &value)?;
        }
        if let Some(path) = env_nonempty("NVR_MODELS_PATH") {
            self.models_path = PathBuf::from(path);
        }
        if let Some(url) = env_nonempty("NVR_API_DETECTION_URL") {
            self.api_detection_url = Some(url);
        }
        if let Some(path) = env_nonempty("NVR_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(value) = env_nonempty("NVR_MAX_STREAMS") {
            self.max_streams = value
                .parse()
                .map_err(|_| NvrError::config("NVR_MAX_STREAMS must be an integer"))?;
        }
        if let Some(value) = env_nonempty("NVR_CONCURRENT_DETECTIONS") {
            self.concurrent_detections = value
                .parse()
                .map_err(|_| NvrError::config("NVR_CONCURRENT_DETECTIONS must be an integer"))?;
        }
        if let Some(value) = env_nonempty("NVR_SHUTDOWN_TIMEOUT_SECS") {
            let seconds: u64 = value.parse().map_err(|_| {
                NvrError::config("NVR_SHUTDOWN_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.shutdown_timeout = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_streams == 0 {
            return Err(NvrError::config("max_streams must be greater than zero"));
        }
        if self.concurrent_detections == 0 {
            return Err(NvrError::config(
                "concurrent_detections must be greater than zero",
            ));
        }
        if self.hls_list_size == 0 {
            return Err(NvrError::config("hls_list_size must be greater than zero"));
        }
        if self.streams.len() > self.max_streams {
            return Err(NvrError::config(format!(
                "{} streams configured but max_streams is {}",
                self.streams.len(),
                self.max_streams
            )));
        }
        let mut seen = HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !seen.insert(stream.name.clone()) {
                return Err(NvrError::config(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
        }
        Ok(())
    }

    pub fn hls_root(&self) -> PathBuf {
        self.storage_path.join("hls")
    }

    /// Directory that holds `<stream>/recording_*.mp4`.
    pub fn mp4_root(&self) -> PathBuf {
        match (&self.mp4_storage_path, self.record_mp4_directly) {
            (Some(path), true) => path.clone(),
            _ => self.storage_path.join("mp4"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(NvrError::config(format!("{} must be a boolean", key))),
    }
}

fn read_config_file(path: &Path) -> Result<NvrConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| NvrError::config(format!("invalid config file {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| NvrError::config(format!("invalid config file {}: {}", path.display(), e)))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_follow_pattern() {
        assert!(validate_stream_name("front_door-1.main").is_ok());
        assert!(validate_stream_name("").is_err());
        assert!(validate_stream_name("has space").is_err());
        assert!(validate_stream_name(&"x".repeat(64)).is_err());
        assert!(validate_stream_name(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn mp4_root_honours_direct_recording() {
        let mut cfg = NvrConfig::with_storage(Path::new("/srv/nvr"));
        assert_eq!(cfg.mp4_root(), PathBuf::from("/srv/nvr/mp4"));
        cfg.mp4_storage_path = Some(PathBuf::from("/mnt/rec"));
        assert_eq!(cfg.mp4_root(), PathBuf::from("/srv/nvr/mp4"));
        cfg.record_mp4_directly = true;
        assert_eq!(cfg.mp4_root(), PathBuf::from("/mnt/rec"));
        assert_eq!(cfg.hls_root(), PathBuf::from("/srv/nvr/hls"));
    }

    #[test]
    fn detection_without_model_is_rejected() {
        let mut stream = StreamConfig::new("cam1", "stub://cam1");
        stream.detect_enabled = true;
        assert!(stream.validate().is_err());
        let stream = stream.with_detection("motion", 1);
        assert!(stream.validate().is_ok());
        assert!(stream.wants_detection());
    }

    #[test]
    fn bool_overrides_parse() {
        assert!(parse_bool("K", "yes").unwrap());
        assert!(!parse_bool("K", "0").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }
}
