// src/config.rs

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::core::error::ConfigError;
use crate::rtsp::TransportKind;

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

fn default_max_size() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

// ---------- Reconnect ----------
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// 0 disables reconnecting.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

// ---------- Storage ----------
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum StorageProviderConfig {
    Local {
        name: String,
        path: PathBuf,
    },
    Aws {
        name: String,
        region: String,
        bucket: String,
        #[serde(default)]
        path: String,
    },
}

impl StorageProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            StorageProviderConfig::Local { name, .. } => name,
            StorageProviderConfig::Aws { name, .. } => name,
        }
    }

    fn target(&self) -> UploadTarget {
        match self {
            StorageProviderConfig::Local { path, .. } => UploadTarget::Local { path: path.clone() },
            StorageProviderConfig::Aws {
                region,
                bucket,
                path,
                ..
            } => UploadTarget::Aws {
                region: region.clone(),
                bucket: bucket.clone(),
                prefix: path.clone(),
            },
        }
    }
}

/// Where a completed segment goes after it is finalized locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Local { path: PathBuf },
    Aws {
        region: String,
        bucket: String,
        prefix: String,
    },
}

// ---------- Recorders ----------
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RecorderEntry {
    pub name: String,
    #[serde(default)]
    pub location: String,
    pub rtsp: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub storage_providers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub local_storage_path: PathBuf,
    #[serde(default = "default_max_size")]
    pub max_size_in_megabytes: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub storage_providers: Vec<StorageProviderConfig>,
    #[serde(default)]
    pub recorders: Vec<RecorderEntry>,
}

/// Everything one worker needs to know about its camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub name: String,
    pub location: String,
    pub url: Url,
    /// `<local_storage_path>/<name>`; segment files extend this prefix.
    pub output_base: PathBuf,
    pub transport: TransportKind,
    pub upload_targets: Vec<UploadTarget>,
}

pub fn load(path: &str) -> Result<Config, ConfigError> {
    let txt = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::with_context(format!("reading {}", path), e))?;
    parse(&txt).map_err(|e| match e {
        ConfigError::Message { message } => ConfigError::message(format!("{}: {}", path, message)),
        other => other,
    })
}

pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let cfg: Config =
        toml::from_str(txt).map_err(|e| ConfigError::with_context("invalid configuration", e))?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn max_segment_bytes(&self) -> u64 {
        self.max_size_in_megabytes.saturating_mul(BYTES_PER_MEGABYTE)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recorders.is_empty() {
            return Err(ConfigError::message("no recorders configured"));
        }
        if self.max_size_in_megabytes == 0 {
            return Err(ConfigError::message("max_size_in_megabytes must be > 0"));
        }
        if self.local_storage_path.as_os_str().is_empty() {
            return Err(ConfigError::message("local_storage_path is empty"));
        }

        let mut providers = HashSet::new();
        for provider in &self.storage_providers {
            if !providers.insert(provider.name()) {
                return Err(ConfigError::message(format!(
                    "duplicate storage provider '{}'",
                    provider.name()
                )));
            }
        }

        let mut names = HashSet::new();
        for rec in &self.recorders {
            if rec.name.is_empty() || rec.name.contains(['/', '\\']) {
                return Err(ConfigError::message(format!(
                    "invalid recorder name '{}'",
                    rec.name
                )));
            }
            if !names.insert(rec.name.as_str()) {
                return Err(ConfigError::message(format!(
                    "duplicate recorder '{}'",
                    rec.name
                )));
            }

            let url = Url::parse(&rec.rtsp).map_err(|e| {
                ConfigError::with_context(format!("recorder '{}': bad rtsp url", rec.name), e)
            })?;
            if url.scheme() != "rtsp" {
                return Err(ConfigError::message(format!(
                    "recorder '{}': expected rtsp:// url, got {}://",
                    rec.name,
                    url.scheme()
                )));
            }
            if url.host_str().is_none_or(str::is_empty) {
                return Err(ConfigError::message(format!(
                    "recorder '{}': rtsp url has no host",
                    rec.name
                )));
            }

            for provider in &rec.storage_providers {
                if !providers.contains(provider.as_str()) {
                    return Err(ConfigError::message(format!(
                        "recorder '{}': unknown storage provider '{}'",
                        rec.name, provider
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolves each recorder into an immutable descriptor.
    pub fn camera_descriptors(&self) -> Result<Vec<CameraDescriptor>, ConfigError> {
        self.recorders
            .iter()
            .map(|rec| {
                let url = Url::parse(&rec.rtsp).map_err(|e| {
                    ConfigError::with_context(format!("recorder '{}': bad rtsp url", rec.name), e)
                })?;

                let upload_targets = rec
                    .storage_providers
                    .iter()
                    .map(|wanted| {
                        self.storage_providers
                            .iter()
                            .find(|p| p.name() == wanted)
                            .map(StorageProviderConfig::target)
                            .ok_or_else(|| {
                                ConfigError::message(format!(
                                    "recorder '{}': unknown storage provider '{}'",
                                    rec.name, wanted
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(CameraDescriptor {
                    name: rec.name.clone(),
                    location: rec.location.clone(),
                    url,
                    output_base: self.local_storage_path.join(&rec.name),
                    transport: rec.transport,
                    upload_targets,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        local_storage_path = "/data/recordings"
        max_size_in_megabytes = 5

        [reconnect]
        max_attempts = 3

        [[storage_providers]]
        provider = "local"
        name = "archive"
        path = "/mnt/archive"

        [[storage_providers]]
        provider = "aws"
        name = "s3"
        region = "eu-central-1"
        bucket = "cams"

        [[recorders]]
        name = "front-door"
        location = "entrance"
        rtsp = "rtsp://admin:pw@10.0.0.5:554/stream1"
        storage_providers = ["archive", "s3"]

        [[recorders]]
        name = "garage"
        rtsp = "rtsp://10.0.0.6/live"
        transport = "udp"
    "#;

    #[test]
    fn sample_config_resolves() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.max_segment_bytes(), 5 * 1024 * 1024);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.initial_backoff_ms, 1000);

        let cams = cfg.camera_descriptors().unwrap();
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].output_base, PathBuf::from("/data/recordings/front-door"));
        assert_eq!(cams[0].transport, TransportKind::Tcp);
        assert_eq!(
            cams[0].upload_targets,
            vec![
                UploadTarget::Local {
                    path: PathBuf::from("/mnt/archive")
                },
                UploadTarget::Aws {
                    region: "eu-central-1".into(),
                    bucket: "cams".into(),
                    prefix: String::new()
                },
            ]
        );
        assert_eq!(cams[1].transport, TransportKind::Udp);
        assert!(cams[1].upload_targets.is_empty());
    }

    #[test]
    fn defaults_apply() {
        let cfg = parse(
            r#"
            local_storage_path = "out"
            [[recorders]]
            name = "cam"
            rtsp = "rtsp://cam.local/live"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.max_size_in_megabytes, 10);
        assert_eq!(cfg.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn rejects_empty_recorder_list() {
        let err = parse(r#"local_storage_path = "out""#).unwrap_err();
        assert!(err.to_string().contains("no recorders"));
    }

    #[test]
    fn rejects_bad_entries() {
        let dup = r#"
            local_storage_path = "out"
            [[recorders]]
            name = "cam"
            rtsp = "rtsp://a/live"
            [[recorders]]
            name = "cam"
            rtsp = "rtsp://b/live"
        "#;
        assert!(parse(dup).unwrap_err().to_string().contains("duplicate"));

        let http = r#"
            local_storage_path = "out"
            [[recorders]]
            name = "cam"
            rtsp = "http://a/live"
        "#;
        assert!(parse(http).unwrap_err().to_string().contains("rtsp://"));

        let unknown = r#"
            local_storage_path = "out"
            [[recorders]]
            name = "cam"
            rtsp = "rtsp://a/live"
            storage_providers = ["nowhere"]
        "#;
        assert!(parse(unknown).unwrap_err().to_string().contains("nowhere"));

        let transport = r#"
            local_storage_path = "out"
            [[recorders]]
            name = "cam"
            rtsp = "rtsp://a/live"
            transport = "sctp"
        "#;
        assert!(parse(transport).is_err());
    }
}
