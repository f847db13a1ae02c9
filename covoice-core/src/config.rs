use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Voice subsystem configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub ice: IceConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_path: None,
        }
    }
}

/// ICE server list handed to every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn: TurnConfig,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn: TurnConfig::default(),
        }
    }
}

/// Optional TURN relay, off unless explicitly enabled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub enabled: bool,
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// One resolved ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceConfig {
    /// STUN servers followed by the TURN relay when enabled
    #[must_use]
    pub fn servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        if self.turn.enabled {
            servers.push(IceServer {
                urls: vec![self.turn.url.clone()],
                username: Some(self.turn.username.clone()),
                credential: Some(self.turn.credential.clone()),
            });
        }
        servers
    }
}

/// Microphone processing constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
        }
    }
}

/// Voice activity detection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Average byte-scaled spectrum level above which the user is speaking
    pub threshold: u8,
    pub fft_size: usize,
    pub smoothing_time_constant: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub tick_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 20,
            fft_size: 256,
            smoothing_time_constant: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            tick_interval_ms: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub initial_volume: u8,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_volume: 100,
        }
    }
}

/// What to do when both sides of a pair send an offer to each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GlarePolicy {
    /// Keep both offerer records; neither side answers the other's offer
    #[default]
    Ignore,
    /// Opt-in tie-break: the participant with the lower id keeps its offer,
    /// the other side drops its own offerer record and answers
    LowerIdOffers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub glare_policy: GlarePolicy,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // COVOICE_VAD__THRESHOLD=30, COVOICE_ICE__STUN_SERVERS=stun:a,stun:b
        builder = builder.add_source(
            Environment::with_prefix("COVOICE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.stun_servers")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate().map_err(|errors| {
            ConfigError::Message(format!("Invalid configuration: {}", errors.join("; ")))
        })?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check value ranges; returns every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for url in &self.ice.stun_servers {
            if !(url.starts_with("stun:") || url.starts_with("stuns:")) {
                errors.push(format!("ice.stun_servers: '{url}' is not a stun: URL"));
            }
        }
        if self.ice.turn.enabled {
            let url = &self.ice.turn.url;
            if !(url.starts_with("turn:") || url.starts_with("turns:")) {
                errors.push(format!("ice.turn.url: '{url}' is not a turn: URL"));
            }
        }

        // Noise suppression and the Opus codec both run at 48 kHz
        if self.audio.sample_rate != 48_000 {
            errors.push(format!(
                "audio.sample_rate: {} unsupported, only 48000",
                self.audio.sample_rate
            ));
        }

        let fft = self.vad.fft_size;
        if !fft.is_power_of_two() || !(32..=32_768).contains(&fft) {
            errors.push(format!(
                "vad.fft_size: {fft} must be a power of two in 32..=32768"
            ));
        }
        if !(0.0..=1.0).contains(&self.vad.smoothing_time_constant) {
            errors.push("vad.smoothing_time_constant must be within 0..=1".to_string());
        }
        if self.vad.min_decibels >= self.vad.max_decibels {
            errors.push("vad.min_decibels must be below vad.max_decibels".to_string());
        }
        if self.vad.tick_interval_ms == 0 {
            errors.push("vad.tick_interval_ms must be positive".to_string());
        }

        if self.playback.initial_volume > 100 {
            errors.push(format!(
                "playback.initial_volume: {} exceeds 100",
                self.playback.initial_volume
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
