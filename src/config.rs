use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_STREAM_URL: &str = "stub://front_camera";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_TRANSPORT_BUFFER: u32 = 1_000_000;
const DEFAULT_BUFFER_CAPACITY: usize = crate::frame::DEFAULT_BUFFER_FRAMES;
const DEFAULT_HIGH_WATER: usize = 60;
const DEFAULT_LOW_WATER: usize = 30;
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;
const DEFAULT_MAX_NETWORK_ERRORS: u32 = 20;
const DEFAULT_IDLE_BACKOFF_MS: u64 = 100;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RECONNECT_BASE_SECS: f64 = 5.0;
const DEFAULT_RECONNECT_MAX_SECS: f64 = 60.0;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_HEALTH_TICK_MS: u64 = 1_000;
const DEFAULT_FREEZE_TIMEOUT_SECS: f64 = 60.0;
const DEFAULT_THROUGHPUT_WINDOW_SECS: f64 = 5.0;
const DEFAULT_MIN_FPS: f64 = 5.0;
const DEFAULT_MEMORY_CHECK_SECS: f64 = 60.0;
const DEFAULT_RECLAIM_SECS: f64 = 300.0;
const DEFAULT_PERSON_CLASS: u32 = 0;
const DEFAULT_MIN_DETECTION_CONFIDENCE: f32 = 0.5;
const DEFAULT_LOG_EVERY_FRAMES: u64 = 30;
const DEFAULT_MIN_CAPTURE_CONFIDENCE: f32 = 0.7;
const DEFAULT_CAPTURE_COOLDOWN_SECS: f64 = 5.0;
const DEFAULT_OUTPUT_DIR: &str = "detected_persons";
const DEFAULT_UPLOAD_ATTEMPTS: u32 = 3;
const DEFAULT_UPLOAD_RETRY_SECS: f64 = 1.0;
const DEFAULT_SESSION_ATTEMPTS: u32 = 6;
const DEFAULT_SESSION_RETRY_SECS: f64 = 5.0;
const DEFAULT_SESSION_RETRY_CAP_SECS: f64 = 30.0;
const DEFAULT_MAX_READ_FAILURES: u32 = 10;
const DEFAULT_READ_RETRY_MS: u64 = 500;

// ----------------------------------------------------------------------------
// File representation
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    stream: Option<StreamConfigFile>,
    buffer: Option<BufferConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    health: Option<HealthConfigFile>,
    detection: Option<DetectionConfigFile>,
    capture: Option<CaptureConfigFile>,
    storage: Option<StorageConfigFile>,
    session: Option<SessionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    fallback_url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    transport_buffer_size: Option<u32>,
    max_consecutive_errors: Option<u32>,
    max_network_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity: Option<usize>,
    high_water: Option<usize>,
    low_water: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    base_delay_secs: Option<f64>,
    max_delay_secs: Option<f64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct HealthConfigFile {
    freeze_timeout_secs: Option<f64>,
    throughput_window_secs: Option<f64>,
    min_fps: Option<f64>,
    memory_check_secs: Option<f64>,
    reclaim_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    person_class_id: Option<u32>,
    min_confidence: Option<f32>,
    log_every_frames: Option<u64>,
    reclaim_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    min_confidence: Option<f32>,
    cooldown_secs: Option<f64>,
    dedup_retention_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    mode: Option<StorageMode>,
    output_dir: Option<PathBuf>,
    upload_endpoint: Option<String>,
    upload_prefix: Option<String>,
    upload_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    max_attempts: Option<u32>,
    retry_delay_secs: Option<f64>,
    max_read_failures: Option<u32>,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

/// Process-wide configuration, built once at start-up and handed to each component.
#[derive(Debug, Clone, Default)]
pub struct SentinelConfig {
    pub stream: StreamSettings,
    pub detection: DetectionSettings,
    pub capture: CaptureSettings,
    pub storage: StorageSettings,
    pub session: SessionSettings,
}

/// Everything `StreamSource` needs; immutable once the source is constructed.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub transport_buffer_size: u32,
    pub buffer_capacity: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub max_consecutive_errors: u32,
    pub max_network_errors: u32,
    /// Producer sleep while the stream is unhealthy or after a failed read.
    pub idle_backoff: Duration,
    /// Bounded wait when joining background tasks in `release()`.
    pub join_timeout: Duration,
    pub reconnect: ReconnectSettings,
    pub health: HealthSettings,
}

#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failed attempts tolerated before the source gives up (state FAILED).
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub tick: Duration,
    pub freeze_timeout: Duration,
    pub throughput_window: Duration,
    pub min_fps: f64,
    pub memory_check_interval: Duration,
    pub reclaim_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub person_class_id: u32,
    pub min_confidence: f32,
    pub log_every_frames: u64,
    pub reclaim_interval: Duration,
    pub box_color: [u8; 3],
    pub box_thickness: u32,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub min_confidence: f32,
    pub cooldown: Duration,
    /// `None` keeps captured ids for the whole session.
    pub dedup_retention: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Keep captures on local disk.
    #[default]
    #[serde(alias = "dev")]
    Development,
    /// Upload captures; nothing is kept locally.
    #[serde(alias = "prod")]
    Production,
}

impl FromStr for StorageMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(StorageMode::Development),
            "prod" | "production" => Ok(StorageMode::Production),
            other => Err(anyhow!("unknown storage mode '{}'; expected prod or dev", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub mode: StorageMode,
    pub output_dir: PathBuf,
    pub upload: Option<UploadSettings>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub endpoint: String,
    pub prefix: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub fallback_url: Option<String>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retry_delay_cap: Duration,
    pub max_read_failures: u32,
    pub read_retry_delay: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_FPS,
            transport_buffer_size: DEFAULT_TRANSPORT_BUFFER,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            max_network_errors: DEFAULT_MAX_NETWORK_ERRORS,
            idle_backoff: Duration::from_millis(DEFAULT_IDLE_BACKOFF_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            reconnect: ReconnectSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl StreamSettings {
    /// Target interval between frames; zero fps disables pacing.
    pub fn frame_interval(&self) -> Duration {
        if self.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.target_fps as f64)
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs_f64(DEFAULT_RECONNECT_BASE_SECS),
            max_delay: Duration::from_secs_f64(DEFAULT_RECONNECT_MAX_SECS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_HEALTH_TICK_MS),
            freeze_timeout: Duration::from_secs_f64(DEFAULT_FREEZE_TIMEOUT_SECS),
            throughput_window: Duration::from_secs_f64(DEFAULT_THROUGHPUT_WINDOW_SECS),
            min_fps: DEFAULT_MIN_FPS,
            memory_check_interval: Duration::from_secs_f64(DEFAULT_MEMORY_CHECK_SECS),
            reclaim_interval: Duration::from_secs_f64(DEFAULT_RECLAIM_SECS),
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            person_class_id: DEFAULT_PERSON_CLASS,
            min_confidence: DEFAULT_MIN_DETECTION_CONFIDENCE,
            log_every_frames: DEFAULT_LOG_EVERY_FRAMES,
            reclaim_interval: Duration::from_secs_f64(DEFAULT_RECLAIM_SECS),
            box_color: [0, 255, 0],
            box_thickness: 2,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CAPTURE_CONFIDENCE,
            cooldown: Duration::from_secs_f64(DEFAULT_CAPTURE_COOLDOWN_SECS),
            dedup_retention: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            mode: StorageMode::Development,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            upload: None,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fallback_url: None,
            max_attempts: DEFAULT_SESSION_ATTEMPTS,
            retry_delay: Duration::from_secs_f64(DEFAULT_SESSION_RETRY_SECS),
            retry_delay_cap: Duration::from_secs_f64(DEFAULT_SESSION_RETRY_CAP_SECS),
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
            read_retry_delay: Duration::from_millis(DEFAULT_READ_RETRY_MS),
        }
    }
}

impl SentinelConfig {
    /// Load from `SENTINEL_CONFIG` (if set), then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let defaults = SentinelConfig::default();
        let stream_file = file.stream.unwrap_or_default();
        let buffer_file = file.buffer.unwrap_or_default();
        let reconnect_file = file.reconnect.unwrap_or_default();
        let health_file = file.health.unwrap_or_default();
        let detection_file = file.detection.unwrap_or_default();
        let capture_file = file.capture.unwrap_or_default();
        let storage_file = file.storage.unwrap_or_default();
        let session_file = file.session.unwrap_or_default();

        let d = &defaults.stream;
        let stream = StreamSettings {
            url: stream_file.url.unwrap_or_else(|| d.url.clone()),
            width: stream_file.width.unwrap_or(d.width),
            height: stream_file.height.unwrap_or(d.height),
            target_fps: stream_file.target_fps.unwrap_or(d.target_fps),
            transport_buffer_size: stream_file
                .transport_buffer_size
                .unwrap_or(d.transport_buffer_size),
            buffer_capacity: buffer_file.capacity.unwrap_or(d.buffer_capacity),
            high_water: buffer_file.high_water.unwrap_or(d.high_water),
            low_water: buffer_file.low_water.unwrap_or(d.low_water),
            max_consecutive_errors: stream_file
                .max_consecutive_errors
                .unwrap_or(d.max_consecutive_errors),
            max_network_errors: stream_file
                .max_network_errors
                .unwrap_or(d.max_network_errors),
            idle_backoff: d.idle_backoff,
            join_timeout: d.join_timeout,
            reconnect: ReconnectSettings {
                base_delay: secs_or(reconnect_file.base_delay_secs, d.reconnect.base_delay)?,
                max_delay: secs_or(reconnect_file.max_delay_secs, d.reconnect.max_delay)?,
                max_attempts: reconnect_file.max_attempts.unwrap_or(d.reconnect.max_attempts),
            },
            health: HealthSettings {
                tick: d.health.tick,
                freeze_timeout: secs_or(health_file.freeze_timeout_secs, d.health.freeze_timeout)?,
                throughput_window: secs_or(
                    health_file.throughput_window_secs,
                    d.health.throughput_window,
                )?,
                min_fps: health_file.min_fps.unwrap_or(d.health.min_fps),
                memory_check_interval: secs_or(
                    health_file.memory_check_secs,
                    d.health.memory_check_interval,
                )?,
                reclaim_interval: secs_or(health_file.reclaim_secs, d.health.reclaim_interval)?,
            },
        };

        let detection = DetectionSettings {
            person_class_id: detection_file
                .person_class_id
                .unwrap_or(defaults.detection.person_class_id),
            min_confidence: detection_file
                .min_confidence
                .unwrap_or(defaults.detection.min_confidence),
            log_every_frames: detection_file
                .log_every_frames
                .unwrap_or(defaults.detection.log_every_frames),
            reclaim_interval: secs_or(
                detection_file.reclaim_secs,
                defaults.detection.reclaim_interval,
            )?,
            ..defaults.detection.clone()
        };

        let capture = CaptureSettings {
            min_confidence: capture_file
                .min_confidence
                .unwrap_or(defaults.capture.min_confidence),
            cooldown: secs_or(capture_file.cooldown_secs, defaults.capture.cooldown)?,
            dedup_retention: match capture_file.dedup_retention_secs {
                Some(secs) => Some(duration_from_secs(secs)?),
                None => None,
            },
        };

        let upload = storage_file.upload_endpoint.map(|endpoint| UploadSettings {
            endpoint,
            prefix: storage_file.upload_prefix.unwrap_or_default(),
            max_attempts: storage_file
                .upload_attempts
                .unwrap_or(DEFAULT_UPLOAD_ATTEMPTS),
            retry_delay: Duration::from_secs_f64(DEFAULT_UPLOAD_RETRY_SECS),
        });
        let storage = StorageSettings {
            mode: storage_file.mode.unwrap_or_default(),
            output_dir: storage_file
                .output_dir
                .unwrap_or_else(|| defaults.storage.output_dir.clone()),
            upload,
        };

        let session = SessionSettings {
            fallback_url: stream_file.fallback_url,
            max_attempts: session_file
                .max_attempts
                .unwrap_or(defaults.session.max_attempts),
            retry_delay: secs_or(session_file.retry_delay_secs, defaults.session.retry_delay)?,
            max_read_failures: session_file
                .max_read_failures
                .unwrap_or(defaults.session.max_read_failures),
            ..defaults.session.clone()
        };

        Ok(Self {
            stream,
            detection,
            capture,
            storage,
            session,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SENTINEL_STREAM_URL") {
            if !url.trim().is_empty() {
                self.stream.url = url;
            }
        }
        if let Ok(url) = std::env::var("SENTINEL_FALLBACK_URL") {
            if !url.trim().is_empty() {
                self.session.fallback_url = Some(url);
            }
        }
        if let Ok(mode) = std::env::var("SENTINEL_ENVIRONMENT") {
            if !mode.trim().is_empty() {
                self.storage.mode = mode.parse()?;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.storage.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(endpoint) = std::env::var("SENTINEL_UPLOAD_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                match self.storage.upload.as_mut() {
                    Some(upload) => upload.endpoint = endpoint,
                    None => {
                        self.storage.upload = Some(UploadSettings {
                            endpoint,
                            prefix: String::new(),
                            max_attempts: DEFAULT_UPLOAD_ATTEMPTS,
                            retry_delay: Duration::from_secs_f64(DEFAULT_UPLOAD_RETRY_SECS),
                        })
                    }
                }
            }
        }
        if let Ok(timeout) = std::env::var("SENTINEL_FREEZE_TIMEOUT_SECS") {
            let seconds: f64 = timeout.parse().map_err(|_| {
                anyhow!("SENTINEL_FREEZE_TIMEOUT_SECS must be a number of seconds")
            })?;
            self.stream.health.freeze_timeout = duration_from_secs(seconds)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let stream = &self.stream;
        if stream.url.trim().is_empty() {
            return Err(anyhow!("stream url must not be empty"));
        }
        if stream.buffer_capacity == 0 {
            return Err(anyhow!("buffer capacity must be greater than zero"));
        }
        if stream.low_water > stream.high_water || stream.high_water > stream.buffer_capacity {
            return Err(anyhow!(
                "buffer watermarks must satisfy low ({}) <= high ({}) <= capacity ({})",
                stream.low_water,
                stream.high_water,
                stream.buffer_capacity
            ));
        }
        if stream.max_consecutive_errors == 0 || stream.max_network_errors == 0 {
            return Err(anyhow!("read error thresholds must be greater than zero"));
        }
        if stream.reconnect.base_delay.is_zero() {
            return Err(anyhow!("reconnect base delay must be greater than zero"));
        }
        if stream.reconnect.max_delay < stream.reconnect.base_delay {
            return Err(anyhow!("reconnect max delay must be at least the base delay"));
        }
        if stream.health.freeze_timeout.is_zero() || stream.health.throughput_window.is_zero() {
            return Err(anyhow!("health timeouts must be greater than zero"));
        }
        validate_confidence("detection.min_confidence", self.detection.min_confidence)?;
        validate_confidence("capture.min_confidence", self.capture.min_confidence)?;
        if self.capture.min_confidence < self.detection.min_confidence {
            return Err(anyhow!(
                "capture confidence ({}) must not be below detection confidence ({})",
                self.capture.min_confidence,
                self.detection.min_confidence
            ));
        }
        if self.detection.log_every_frames == 0 {
            return Err(anyhow!("detection.log_every_frames must be greater than zero"));
        }
        if self.storage.mode == StorageMode::Production && self.storage.upload.is_none() {
            return Err(anyhow!("production storage requires an upload endpoint"));
        }
        Ok(())
    }
}

fn validate_confidence(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn duration_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| anyhow!("invalid duration: {} seconds", secs))
}

fn secs_or(value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        Some(secs) => duration_from_secs(secs),
        None => Ok(default),
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
