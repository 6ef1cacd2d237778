use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub uploads: UploadConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where uploaded videos land. Only one file is ever kept: every accepted
/// upload overwrites `directory/file_name`.
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub directory: PathBuf,
    #[serde(default = "default_upload_file_name")]
    pub file_name: String,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: usize,
}

fn default_upload_file_name() -> String {
    "uploaded_video.mp4".into()
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["mp4".into()]
}

fn default_max_size_mb() -> usize {
    512
}

impl UploadConfig {
    pub fn get_file_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    /// Checks the extension after the last dot, ignoring case.
    pub fn is_allowed(&self, file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((_, extension)) => self
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(extension)),
            None => false,
        }
    }

    /// Maps a `video_path` query value onto the upload directory. Anything
    /// other than a single plain file name is refused.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(file)), None) => Some(self.directory.join(file)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_min_probability")]
    pub min_probability: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
}

fn default_input_size() -> u32 {
    640
}

fn default_min_probability() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

impl ModelConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_path()));
        }
        if self.input_size == 0 {
            return Err("Model input size must be greater than zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_class_labels")]
    pub class_labels: Vec<String>,
    #[serde(default = "default_ground_truth")]
    pub ground_truth: Vec<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            class_labels: default_class_labels(),
            ground_truth: default_ground_truth(),
        }
    }
}

fn default_class_labels() -> Vec<String> {
    vec!["fire".into()]
}

fn default_ground_truth() -> Vec<u64> {
    vec![0, 2, 5]
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("FIRE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
