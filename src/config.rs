use anyhow::{Context, Result, bail};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/reddit-save-bot-env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOADER: &str = "yt-dlp";
pub const DEFAULT_VIDEO_SIZE_LIMIT: u64 = 50 * 1024 * 1024;
/// Subdirectory of the system temp dir used when no scratch dir is set.
pub const DEFAULT_SCRATCH_SUBDIR: &str = "reddit-save-bot";

/// Values read from the optional env-style config file. Every field is
/// optional; anything missing falls through to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub telegram_token: Option<String>,
    pub personal_id: Option<i64>,
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub scratch_dir: Option<PathBuf>,
    pub max_video_bytes: Option<u64>,
    pub downloader: Option<String>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub telegram_token: String,
    /// `None` puts the bot in public mode.
    pub personal_id: Option<i64>,
    pub reddit_client_id: String,
    pub reddit_client_secret: String,
    pub scratch_dir: PathBuf,
    pub max_video_bytes: u64,
    pub downloader: String,
}

impl ServerConfig {
    /// Layers `overrides` (flags and environment, already merged by clap) on
    /// top of the env-file, then on top of the defaults.
    pub fn resolve(overrides: EnvConfig, file: Option<EnvConfig>) -> Result<Self> {
        let file = file.unwrap_or_default();
        let telegram_token = overrides
            .telegram_token
            .or(file.telegram_token)
            .filter(|token| !token.is_empty());
        let Some(telegram_token) = telegram_token else {
            bail!("telegram bot token is required");
        };

        Ok(Self {
            port: overrides.port.or(file.port).unwrap_or(DEFAULT_PORT),
            host: overrides
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            telegram_token,
            personal_id: overrides.personal_id.or(file.personal_id),
            reddit_client_id: overrides
                .reddit_client_id
                .or(file.reddit_client_id)
                .unwrap_or_default(),
            reddit_client_secret: overrides
                .reddit_client_secret
                .or(file.reddit_client_secret)
                .unwrap_or_default(),
            scratch_dir: overrides
                .scratch_dir
                .or(file.scratch_dir)
                .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SCRATCH_SUBDIR)),
            max_video_bytes: overrides
                .max_video_bytes
                .or(file.max_video_bytes)
                .unwrap_or(DEFAULT_VIDEO_SIZE_LIMIT),
            downloader: overrides
                .downloader
                .or(file.downloader)
                .unwrap_or_else(|| DEFAULT_DOWNLOADER.to_string()),
        })
    }

    pub fn is_public(&self) -> bool {
        self.personal_id.is_none()
    }

    pub fn has_reddit_credentials(&self) -> bool {
        !self.reddit_client_id.is_empty() && !self.reddit_client_secret.is_empty()
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value_raw)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value_raw.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing PORT from {}", path.display()))?;
                cfg.port = Some(port);
            }
            "HOST" => cfg.host = Some(value.to_string()),
            "TELEGRAM_BOT_TOKEN" => cfg.telegram_token = Some(value.to_string()),
            "TELEGRAM_PERSONAL_ID" => {
                let id: i64 = value.parse().with_context(|| {
                    format!("Parsing TELEGRAM_PERSONAL_ID from {}", path.display())
                })?;
                cfg.personal_id = Some(id);
            }
            "REDDIT_CLIENT_ID" => cfg.reddit_client_id = Some(value.to_string()),
            "REDDIT_CLIENT_SECRET" => cfg.reddit_client_secret = Some(value.to_string()),
            "SCRATCH_DIR" => cfg.scratch_dir = Some(PathBuf::from(value)),
            "MAX_VIDEO_BYTES" => {
                let limit: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing MAX_VIDEO_BYTES from {}", path.display()))?;
                cfg.max_video_bytes = Some(limit);
            }
            "DOWNLOADER_PROGRAM" => cfg.downloader = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(Some(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn with_token() -> EnvConfig {
        EnvConfig {
            telegram_token: Some("123:abc".into()),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn read_env_config_extracts_fields() {
        let cfg = make_config(
            "# bot settings\nPORT=\"4242\"\nTELEGRAM_PERSONAL_ID=42\nREDDIT_CLIENT_ID=\"id\"\n",
        );
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.personal_id, Some(42));
        assert_eq!(parsed.reddit_client_id.as_deref(), Some("id"));
        assert_eq!(parsed.reddit_client_secret, None);
    }

    #[test]
    fn read_env_config_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read_env_config(&dir.path().join("absent")).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn read_env_config_rejects_bad_port() {
        let cfg = make_config("PORT=eighty\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("Parsing PORT"));
    }

    #[test]
    fn resolve_requires_telegram_token() {
        let err = ServerConfig::resolve(EnvConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("telegram bot token is required"));
    }

    #[test]
    fn resolve_applies_defaults() {
        let cfg = ServerConfig::resolve(with_token(), None).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.max_video_bytes, DEFAULT_VIDEO_SIZE_LIMIT);
        assert_eq!(cfg.downloader, DEFAULT_DOWNLOADER);
        assert_eq!(
            cfg.scratch_dir,
            std::env::temp_dir().join(DEFAULT_SCRATCH_SUBDIR)
        );
        assert!(cfg.is_public());
        assert!(!cfg.has_reddit_credentials());
    }

    #[test]
    fn resolve_prefers_overrides_over_file() {
        let file = EnvConfig {
            port: Some(9000),
            personal_id: Some(7),
            reddit_client_id: Some("file-id".into()),
            reddit_client_secret: Some("file-secret".into()),
            ..with_token()
        };
        let overrides = EnvConfig {
            port: Some(9100),
            reddit_client_id: Some("flag-id".into()),
            ..EnvConfig::default()
        };
        let cfg = ServerConfig::resolve(overrides, Some(file)).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.personal_id, Some(7));
        assert_eq!(cfg.reddit_client_id, "flag-id");
        assert_eq!(cfg.reddit_client_secret, "file-secret");
        assert!(cfg.has_reddit_credentials());
        assert!(!cfg.is_public());
    }
}
