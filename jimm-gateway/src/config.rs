//! Host binary configuration.
//!
//! `spec.md` is explicit that the core's own contract is free of environment variables and
//! on-disk files: TLS configuration, controller records, and the authentication services are
//! injected by whoever embeds the proxy engine. This module is the *binary's* ambient
//! wiring around that core — bind address, listener TLS material, log directives, and the
//! static controller directory a standalone deployment needs to actually route clients
//! somewhere. It follows the teacher's `ConfFile` (serde DTO) / `Conf` (validated, typed)
//! split, with a `ConfHandle` wrapping the current value behind a lock so it can be
//! hot-reloaded later without touching call sites.

use crate::services::{AddressScope, CandidateAddress, ControllerRecord};
use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:17070";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_FACADE_SEGMENT: &str = "api";

/// One entry of the on-disk controller directory: everything [`crate::dialer::Dialer`] needs
/// to reach a controller, in the JSON shape an operator hand-writes or a provisioning tool
/// generates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerRecordDto {
    #[serde(rename = "ca-certificate", default)]
    pub ca_certificate: String,
    #[serde(rename = "tls-hostname")]
    pub tls_hostname: String,
    #[serde(rename = "public-address", default)]
    pub public_address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<CandidateAddressDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateAddressDto {
    #[serde(rename = "host-port")]
    pub host_port: String,
    #[serde(default)]
    pub scope: String,
}

impl From<&ControllerRecordDto> for ControllerRecord {
    fn from(dto: &ControllerRecordDto) -> Self {
        Self {
            ca_certificate: dto.ca_certificate.clone(),
            tls_hostname: dto.tls_hostname.clone(),
            public_address: dto.public_address.clone(),
            addresses: dto
                .addresses
                .iter()
                .map(|a| CandidateAddress {
                    host_port: a.host_port.clone(),
                    scope: AddressScope::parse(&a.scope),
                })
                .collect(),
        }
    }
}

/// The on-disk configuration shape, deserialized verbatim and otherwise unvalidated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfFile {
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,
    #[serde(rename = "tls-certificate-file")]
    pub tls_certificate_file: Option<Utf8PathBuf>,
    #[serde(rename = "tls-private-key-file")]
    pub tls_private_key_file: Option<Utf8PathBuf>,
    #[serde(rename = "log-file")]
    pub log_file: Option<Utf8PathBuf>,
    #[serde(rename = "log-filter")]
    pub log_filter: Option<String>,
    #[serde(rename = "facade-path-segment")]
    pub facade_path_segment: Option<String>,
    /// Stand-in for the out-of-scope persistent controller-record store: a static map from
    /// controller UUID to its dial information, good enough to drive the binary end to end
    /// without a real provisioning backend.
    #[serde(default)]
    pub controllers: HashMap<String, ControllerRecordDto>,
}

impl ConfFile {
    fn generate_new() -> Self {
        Self::default()
    }
}

/// Validated, typed configuration the rest of the binary consumes.
#[derive(Debug, Clone)]
pub struct Conf {
    pub bind_address: SocketAddr,
    pub tls_certificate_file: Option<Utf8PathBuf>,
    pub tls_private_key_file: Option<Utf8PathBuf>,
    pub log_file: Utf8PathBuf,
    pub log_filter: String,
    pub facade_path_segment: String,
    pub controllers: HashMap<String, ControllerRecord>,
}

impl Conf {
    pub fn from_conf_file(conf_file: &ConfFile) -> anyhow::Result<Self> {
        let bind_address = conf_file
            .bind_address
            .as_deref()
            .unwrap_or(DEFAULT_BIND_ADDRESS)
            .parse()
            .context("invalid bind-address")?;

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| get_data_dir().join("jimm-gateway.log"));

        let controllers = conf_file
            .controllers
            .iter()
            .map(|(uuid, dto)| (uuid.clone(), ControllerRecord::from(dto)))
            .collect();

        Ok(Self {
            bind_address,
            tls_certificate_file: conf_file.tls_certificate_file.clone(),
            tls_private_key_file: conf_file.tls_private_key_file.clone(),
            log_file,
            log_filter: conf_file.log_filter.clone().unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned()),
            facade_path_segment: conf_file
                .facade_path_segment
                .clone()
                .unwrap_or_else(|| DEFAULT_FACADE_SEGMENT.to_owned()),
            controllers,
        })
    }
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<ConfFile>>,
    changed: Notify,
}

/// Shared, swappable handle onto the current configuration. Cloning is cheap; call
/// [`ConfHandle::get_conf`] fresh rather than holding the `Arc<Conf>` across await points
/// that might span a reload.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

impl ConfHandle {
    /// Load configuration from `$JIMM_CONFIG_PATH` (or the platform default path),
    /// generating and persisting a default file if none exists yet.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    /// Build a handle directly from a JSON string, bypassing disk I/O. Used by tests.
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<ConfFile>(json_config).context("invalid JSON config")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        })
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    pub fn get_conf_file(&self) -> Arc<ConfFile> {
        self.inner.conf_file.read().clone()
    }

    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }

    pub fn save_new_conf_file(&self, conf_file: ConfFile) -> anyhow::Result<()> {
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;
        save_config(&conf_file).context("failed to save configuration")?;
        *self.inner.conf.write() = Arc::new(conf);
        *self.inner.conf_file.write() = Arc::new(conf_file);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(path) = env::var("JIMM_DATA_DIR") {
        return Utf8PathBuf::from(path);
    }

    if cfg!(target_os = "windows") {
        let program_data = env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
        Utf8PathBuf::from(program_data).join("Juju").join("jimm-gateway")
    } else {
        Utf8PathBuf::from("/etc/jimm-gateway")
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    env::var("JIMM_CONFIG_PATH")
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join("jimm-gateway.json"))
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(anyhow::Error::new(error).context(format!("couldn't open config file at {conf_path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<ConfFile> {
    let conf_file_path = get_conf_file_path();

    match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => Ok(conf_file),
        None => {
            let defaults = ConfFile::generate_new();
            save_config(&defaults).context("failed to save default configuration")?;
            Ok(defaults)
        }
    }
}

fn save_config(conf_file: &ConfFile) -> anyhow::Result<()> {
    let conf_file_path = get_conf_file_path();
    if let Some(parent) = conf_file_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {parent}"))?;
    }
    let json = serde_json::to_string_pretty(conf_file).context("failed to serialize configuration")?;
    std::fs::write(&conf_file_path, json).with_context(|| format!("failed to write {conf_file_path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_absent() {
        let conf = Conf::from_conf_file(&ConfFile::default()).unwrap();
        assert_eq!(conf.bind_address.port(), 17070);
        assert_eq!(conf.log_filter, "info");
        assert_eq!(conf.facade_path_segment, "api");
        assert!(conf.controllers.is_empty());
    }

    #[test]
    fn controller_directory_parses_scoped_addresses() {
        let json = r#"{
            "controllers": {
                "deadbeef-0000-0000-0000-000000000000": {
                    "tls-hostname": "controller.example",
                    "public-address": "pub.example:17070",
                    "addresses": [
                        {"host-port": "a:17070", "scope": "cloud-local"},
                        {"host-port": "b:17070", "scope": "machine-local"}
                    ]
                }
            }
        }"#;
        let conf_file: ConfFile = serde_json::from_str(json).unwrap();
        let conf = Conf::from_conf_file(&conf_file).unwrap();
        let record = &conf.controllers["deadbeef-0000-0000-0000-000000000000"];
        assert_eq!(record.dial_candidates(), vec!["pub.example:17070".to_owned(), "a:17070".to_owned()]);
    }
}
