/// Configuration management for Shutterhub
use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub matching: MatchingConfig,
    pub notifications: NotificationConfig,
    pub realtime: RealtimeConfig,
    pub operators: Vec<OperatorCredential>,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Base URL used when building public object URLs
    pub public_url: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub record_db: PathBuf,
    pub object_store_directory: PathBuf,
    /// HMAC key for signed object URLs
    pub signing_secret: String,
    pub signed_url_ttl_secs: u64,
}

/// Client-side upload limits and compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_file_size: usize,
    pub max_files: usize,
    pub allowed_mime_types: Vec<String>,
    pub compress_images: bool,
    pub max_image_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024, // 10MB
            max_files: 50,
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
                "image/heic".to_string(),
            ],
            compress_images: true,
            max_image_dimension: 2048,
            jpeg_quality: 85,
        }
    }
}

/// Face-match queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub default_priority: i32,
    pub pending_limit: i64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            default_priority: 5,
            pending_limit: 100,
        }
    }
}

/// Notification retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub default_ttl_days: i64,
    pub prune_interval_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_ttl_days: 30,
            prune_interval_secs: 3600,
        }
    }
}

/// Change feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Buffered events per channel before lagging
    pub channel_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Operator allowed to moderate matches and inspect the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCredential {
    pub id: String,
    pub token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl HubConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> HubResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("SHUTTERHUB_HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("SHUTTERHUB_PORT")
            .unwrap_or_else(|_| "8787".to_string())
            .parse()
            .map_err(|_| HubError::Validation("Invalid port number".to_string()))?;
        let public_url = env::var("SHUTTERHUB_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", hostname, port));

        let data_directory: PathBuf = env::var("SHUTTERHUB_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let record_db = env::var("SHUTTERHUB_RECORD_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("records.sqlite"));
        let object_store_directory = env::var("SHUTTERHUB_OBJECT_STORE_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("objects"));
        let signing_secret = env::var("SHUTTERHUB_SIGNING_SECRET")
            .map_err(|_| HubError::Validation("Signing secret required".to_string()))?;
        let signed_url_ttl_secs = parse_or("SHUTTERHUB_SIGNED_URL_TTL", 3600);

        let defaults = UploadConfig::default();
        let allowed_mime_types = env::var("SHUTTERHUB_UPLOAD_ALLOWED_TYPES")
            .map(|s| split_list(&s))
            .unwrap_or(defaults.allowed_mime_types);
        let upload = UploadConfig {
            max_file_size: parse_or("SHUTTERHUB_UPLOAD_MAX_SIZE", defaults.max_file_size),
            max_files: parse_or("SHUTTERHUB_UPLOAD_MAX_FILES", defaults.max_files),
            allowed_mime_types,
            compress_images: parse_or("SHUTTERHUB_UPLOAD_COMPRESS", defaults.compress_images),
            max_image_dimension: parse_or(
                "SHUTTERHUB_UPLOAD_MAX_DIMENSION",
                defaults.max_image_dimension,
            ),
            jpeg_quality: parse_or("SHUTTERHUB_UPLOAD_JPEG_QUALITY", defaults.jpeg_quality),
        };

        let matching = MatchingConfig {
            default_priority: parse_or("SHUTTERHUB_MATCH_DEFAULT_PRIORITY", 5),
            pending_limit: parse_or("SHUTTERHUB_MATCH_PENDING_LIMIT", 100),
        };

        let notifications = NotificationConfig {
            default_ttl_days: parse_or("SHUTTERHUB_NOTIFICATION_TTL_DAYS", 30),
            prune_interval_secs: parse_or("SHUTTERHUB_NOTIFICATION_PRUNE_INTERVAL", 3600),
        };

        let realtime = RealtimeConfig {
            channel_capacity: parse_or("SHUTTERHUB_REALTIME_CHANNEL_CAPACITY", 256),
        };

        let operators = parse_operators(
            &env::var("SHUTTERHUB_OPERATOR_TOKENS").unwrap_or_default(),
        )?;

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(HubConfig {
            service: ServiceConfig {
                hostname,
                port,
                public_url,
            },
            storage: StorageConfig {
                data_directory,
                record_db,
                object_store_directory,
                signing_secret,
                signed_url_ttl_secs,
            },
            upload,
            matching,
            notifications,
            realtime,
            operators,
            logging: LoggingConfig { level: log_level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> HubResult<()> {
        if self.service.hostname.is_empty() {
            return Err(HubError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.storage.signing_secret.len() < 32 {
            return Err(HubError::Validation(
                "Signing secret must be at least 32 characters".to_string(),
            ));
        }

        if self.upload.max_file_size == 0 || self.upload.max_files == 0 {
            return Err(HubError::Validation(
                "Upload limits must be greater than zero".to_string(),
            ));
        }

        if self.upload.jpeg_quality == 0 || self.upload.jpeg_quality > 100 {
            return Err(HubError::Validation(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }

        if self.realtime.channel_capacity == 0 {
            return Err(HubError::Validation(
                "Realtime channel capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Find the operator owning a bearer token
    pub fn operator_for_token(&self, token: &str) -> Option<&OperatorCredential> {
        self.operators.iter().find(|op| op.token == token)
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `id:token` pairs from a comma-separated list
fn parse_operators(value: &str) -> HubResult<Vec<OperatorCredential>> {
    split_list(value)
        .into_iter()
        .map(|pair| match pair.split_once(':') {
            Some((id, token)) if !id.is_empty() && !token.is_empty() => Ok(OperatorCredential {
                id: id.to_string(),
                token: token.to_string(),
            }),
            _ => Err(HubError::Validation(format!(
                "Invalid operator credential '{}', expected id:token",
                pair
            ))),
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config(data_directory: PathBuf) -> HubConfig {
    HubConfig {
        service: ServiceConfig {
            hostname: "127.0.0.1".to_string(),
            port: 8787,
            public_url: "http://localhost:8787".to_string(),
        },
        storage: StorageConfig {
            record_db: data_directory.join("records.sqlite"),
            object_store_directory: data_directory.join("objects"),
            data_directory,
            signing_secret: "0123456789abcdef0123456789abcdef".to_string(),
            signed_url_ttl_secs: 3600,
        },
        upload: UploadConfig::default(),
        matching: MatchingConfig::default(),
        notifications: NotificationConfig::default(),
        realtime: RealtimeConfig::default(),
        operators: vec![OperatorCredential {
            id: "op-1".to_string(),
            token: "secret-token".to_string(),
        }],
        logging: LoggingConfig {
            level: "info".to_string(),
        },
    }
}
