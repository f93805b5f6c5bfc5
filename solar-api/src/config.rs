use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const ENV_PREFIX: &str = "SOLAR_API";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: RuntimeMode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default = "default_backend")]
    pub backend: BackendConfig,
}

/// Controls how much detail error responses carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Development,
    #[default]
    Production,
}

impl RuntimeMode {
    pub fn is_development(self) -> bool {
        self == RuntimeMode::Development
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_json_body_bytes")]
    pub json_body_bytes: usize,
    #[serde(default = "default_upload_body_bytes")]
    pub upload_body_bytes: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Answer `GET /api/solar` with 404 instead of `[]` when nothing is stored.
    #[serde(default = "default_true")]
    pub empty_list_not_found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_collection")]
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        root_path: PathBuf,
        #[serde(default = "default_physical_bucket")]
        physical_bucket: String,
        /// Base of the URLs handed out for stored images; normally this
        /// service's own `/media` route.
        #[serde(default = "default_public_base_url")]
        public_base_url: String,
    },
    S3 {
        region: String,
        physical_bucket: String,
        endpoint: Option<String>,
        public_base_url: Option<String>,
    },
    Gcs {
        physical_bucket: String,
        public_base_url: Option<String>,
    },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_json_body_bytes() -> usize {
    20 * 1024
}

fn default_upload_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_collection() -> String {
    "solar".to_string()
}

fn default_physical_bucket() -> String {
    "solar-data".to_string()
}

fn default_public_base_url() -> String {
    format!("http://{}:{}/media", default_host(), default_port())
}

fn default_backend() -> BackendConfig {
    BackendConfig::Local {
        root_path: PathBuf::from("./data"),
        physical_bucket: default_physical_bucket(),
        public_base_url: default_public_base_url(),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            json_body_bytes: default_json_body_bytes(),
            upload_body_bytes: default_upload_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            empty_list_not_found: default_true(),
        }
    }
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            api: ApiConfig::default(),
            documents: DocumentsConfig::default(),
            backend: default_backend(),
        }
    }
}

impl Config {
    /// Serde defaults, then the file named by `CONFIG_PATH`, then
    /// `SOLAR_API__*` variables, then the bare `PORT` and `APP_ENV` variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(
            std::env::var("CONFIG_PATH").ok().as_deref(),
            std::env::var("PORT").ok(),
            std::env::var("APP_ENV").ok(),
        )
    }

    fn load_from(
        path: Option<&str>,
        port: Option<String>,
        mode: Option<String>,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("server.port", port)?
            .set_override_option("mode", mode.map(|m| m.to_lowercase()))?
            .build()?;

        settings.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::load_from(None, None, None).unwrap();
        assert_eq!(config.mode, RuntimeMode::Production);
        assert_eq!(config.server_addr(), "127.0.0.1:8000");
        assert_eq!(config.limits.json_body_bytes, 20 * 1024);
        assert!(config.api.empty_list_not_found);
        assert_eq!(config.documents.collection, "solar");
        assert!(matches!(config.backend, BackendConfig::Local { .. }));
    }

    #[test]
    fn test_port_and_mode_overrides() {
        let config =
            Config::load_from(None, Some("9100".to_string()), Some("Development".to_string()))
                .unwrap();
        assert_eq!(config.server.port, 9100);
        assert!(config.mode.is_development());
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
mode = "development"

[api]
empty_list_not_found = false

[backend]
type = "s3"
region = "eu-west-1"
physical_bucket = "solar-images"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load_from(Some(&path), None, None).unwrap();

        assert!(config.mode.is_development());
        assert!(!config.api.empty_list_not_found);
        match config.backend {
            BackendConfig::S3 {
                region,
                physical_bucket,
                endpoint,
                ..
            } => {
                assert_eq!(region, "eu-west-1");
                assert_eq!(physical_bucket, "solar-images");
                assert!(endpoint.is_none());
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }
}
