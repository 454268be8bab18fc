//! Service configuration.
//!
//! Loaded from a JSON file. `__comments__` keys are stripped at any depth
//! before deserialisation so operators can annotate the file freely. When
//! the file is missing but a `.sample` sibling exists, the sample is copied
//! into place and start-up still aborts so the operator edits it first.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

/// Configuration load failures; all of them abort start-up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration file not found at {}{}", .path.display(), sample_hint(.sample_copied))]
    Missing { path: PathBuf, sample_copied: bool },
    #[error("cannot read configuration at {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

fn sample_hint(copied: &bool) -> &'static str {
    if *copied {
        "; a sample was copied into place, edit it and restart"
    } else {
        ""
    }
}

/// Transport selector shared by the trigger listener and the syslog
/// collector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

/// PLC trigger listener endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

/// Outbound SSH profile for the managed access points.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Upload command sent to the device; `{ingress}` and `{event_id}` are
    /// substituted.
    #[serde(default = "default_command_template")]
    pub command_template: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

/// External syslog collector endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SyslogConfig {
    pub ip: String,
    pub port: u16,
    pub transport: Transport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Host key for the embedded SFTP endpoint.
    pub sftp_rsa_keyfile: PathBuf,
    pub sftp_host_ip: String,
    pub sftp_listen_port: u16,
    pub listener: ListenerConfig,
    pub shared_secret: String,
    /// Characters the shared secret may contain beyond alphanumerics.
    #[serde(default)]
    pub allowed_secret_chars: String,
    /// Credential service; queried as `<credentials_url>?ip=<ip>`.
    pub credentials_url: String,
    pub device_profile: DeviceProfile,
    /// Address the devices upload to, embedded into the upload command.
    pub ingress_ip: String,
    /// Half-width, in seconds, of the log slice kept around the fault time.
    #[serde(default = "default_event_window")]
    pub event_window_seconds: u64,
    pub syslog: SyslogConfig,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_command_template() -> String {
    "copy event-logging upload tftp://{ingress}/{event_id}.tar.gz".to_owned()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_event_window() -> u64 {
    2
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Config {
    /// Loads and cleans the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            let sample_copied = copy_sample(path);
            return Err(Error::Missing { path: path.to_owned(), sample_copied });
        }
        let raw = fs::read_to_string(path)
            .map_err(|source| Error::Io { path: path.to_owned(), source })?;
        let mut value: Value = serde_json::from_str(&raw)?;
        strip_comments(&mut value);
        Ok(serde_json::from_value(value)?)
    }
}

/// Copies `<file>.sample` next to the requested path, if one exists.
fn copy_sample(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let sample = path.with_file_name(format!("{name}.sample"));
    if sample.exists() && fs::copy(&sample, path).is_ok() {
        info!(?path, "sample configuration copied into place");
        true
    } else {
        false
    }
}

/// Recursively removes `__comments__` keys.
fn strip_comments(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("__comments__");
            for child in map.values_mut() {
                strip_comments(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                strip_comments(child);
            }
        }
        _ => {}
    }
}
