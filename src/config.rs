use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::remote::{Credentials, ServerSettings};

pub const DEFAULT_CONFIG_FILE: &str = "formcat.json";
pub const DEFAULT_FORM_LIST_PATH: &str = "/formList";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub form_list_path: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub hide_old_versions: Option<bool>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub server: ServerSettings,
    /// `None` leaves the choice of storage root to the host.
    pub storage_root: Option<Utf8PathBuf>,
    pub hide_old_versions: bool,
    pub request_timeout: Duration,
    pub download_workers: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(CatalogError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CatalogError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CatalogError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(CatalogError::ConfigParse(format!(
                "unsupported schemaVersion {schema_version}"
            )));
        }

        let server_url = config
            .server_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| CatalogError::ConfigParse("serverUrl is required".to_string()))?;
        let parsed = Url::parse(&server_url)
            .map_err(|_| CatalogError::InvalidServerUrl(server_url.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CatalogError::InvalidServerUrl(server_url));
        }

        let credentials = match (config.username, config.password) {
            (Some(username), password) if !username.trim().is_empty() => Some(Credentials {
                username: username.trim().to_string(),
                password: password.unwrap_or_default(),
            }),
            (_, Some(_)) => {
                return Err(CatalogError::ConfigParse(
                    "password given without username".to_string(),
                ));
            }
            _ => None,
        };

        let list_path = config
            .form_list_path
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| DEFAULT_FORM_LIST_PATH.to_string());

        let request_timeout = match config.request_timeout_secs {
            Some(0) => {
                return Err(CatalogError::ConfigParse(
                    "requestTimeoutSecs must be positive".to_string(),
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        Ok(ResolvedConfig {
            schema_version,
            server: ServerSettings {
                server_url,
                list_path,
                credentials,
            },
            storage_root: config.storage_root.map(Utf8PathBuf::from),
            hide_old_versions: config.hide_old_versions.unwrap_or(false),
            request_timeout,
            download_workers: config
                .download_workers
                .unwrap_or(DEFAULT_DOWNLOAD_WORKERS)
                .max(1),
        })
    }
}

/// Per-user data directory used when the config names no storage root.
pub fn default_storage_root() -> Result<Utf8PathBuf, CatalogError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("formcat")).ok())
        .ok_or_else(|| CatalogError::Storage("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config {
            server_url: Some("https://forms.example.org".to_string()),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.server.list_path, DEFAULT_FORM_LIST_PATH);
        assert!(resolved.server.credentials.is_none());
        assert!(!resolved.hide_old_versions);
        assert_eq!(resolved.request_timeout, Duration::from_secs(30));
        assert_eq!(resolved.download_workers, 4);
    }

    #[test]
    fn rejects_non_http_server() {
        let config = Config {
            server_url: Some("ftp://forms.example.org".to_string()),
            ..Config::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(CatalogError::InvalidServerUrl(_))
        );
    }
}
