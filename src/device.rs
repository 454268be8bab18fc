//! Outbound control of the faulting access point.
//!
//! On `CIPEventCreated` the manager resolves credentials for the device,
//! opens an SSH session to the record's address and issues the single
//! upload command that makes the device push `<event_id>.tar.gz` back into
//! the embedded SFTP endpoint. The command string carries the correlation
//! key through the external round-trip. Any failure drops the event with a
//! log line; the PLC re-triggers on the next fault.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::config::DeviceProfile;
use crate::store::EventStore;

/// Login material returned by the credential service.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential fetch failed: {0}")]
    Credentials(#[from] reqwest::Error),
    #[error("ssh failure: {0}")]
    Ssh(#[from] russh::Error),
    #[error("device rejected credentials for user {0}")]
    AuthRejected(String),
    #[error("no event record for id {0}")]
    UnknownEvent(String),
}

/// Where device credentials come from. A seam so the manager is testable
/// without the HTTPS service.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, ip: &str) -> Result<Credentials, Error>;
}

/// The production source: `GET <url>?ip=<ip>` returning
/// `{"username": …, "password": …}`.
pub struct HttpCredentialSource {
    url: String,
    client: reqwest::Client,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, ip: &str) -> Result<Credentials, Error> {
        let response =
            self.client.get(&self.url).query(&[("ip", ip)]).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Accepts whatever host key the device presents. The fleet's keys are not
/// tracked; the trigger secret upstream is the authentication that matters.
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Drives the SSH hop of the pipeline.
pub struct DeviceManager {
    store: Arc<EventStore>,
    credentials: Arc<dyn CredentialSource>,
    profile: DeviceProfile,
    ingress_ip: String,
}

impl DeviceManager {
    pub fn new(
        store: Arc<EventStore>,
        credentials: Arc<dyn CredentialSource>,
        profile: DeviceProfile,
        ingress_ip: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self { store, credentials, profile, ingress_ip: ingress_ip.into() })
    }

    /// Subscribes the manager to new-event signals. The SSH work is
    /// off-loaded to its own task; bus dispatch never blocks on it.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let manager = self.clone();
        bus.subscribe(Topic::CipEventCreated, move |_, event| {
            if let Event::CipEventCreated { event_id } = event {
                let manager = manager.clone();
                let event_id = event_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = manager.request_upload(&event_id).await {
                        error!(event_id, %err, "device upload request failed, event dropped");
                    }
                });
            }
        });
    }

    /// The upload command with the correlation key substituted in.
    pub fn upload_command(&self, event_id: &str) -> String {
        self.profile
            .command_template
            .replace("{ingress}", &self.ingress_ip)
            .replace("{event_id}", event_id)
    }

    /// Fetches credentials, logs into the device named by the record and
    /// commands it to upload its event-log archive.
    pub async fn request_upload(&self, event_id: &str) -> Result<(), Error> {
        let record =
            self.store.get(event_id).ok_or_else(|| Error::UnknownEvent(event_id.to_owned()))?;
        let credentials = self.credentials.fetch(&record.ip).await?;
        let command = self.upload_command(event_id);
        debug!(event_id, ip = record.ip, %command, "commanding device upload");
        self.run_on_device(&record.ip, &credentials, &command).await?;
        record.add_log(format!("upload command issued: {command}"));
        info!(event_id, ip = record.ip, "device session completed");
        Ok(())
    }

    async fn run_on_device(
        &self,
        ip: &str,
        credentials: &Credentials,
        command: &str,
    ) -> Result<(), Error> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(self.profile.connect_timeout_seconds)),
            ..client::Config::default()
        });
        let mut session =
            client::connect(config, (ip, self.profile.port), AcceptAnyHostKey).await?;
        let auth = session
            .authenticate_password(credentials.username.as_str(), credentials.password.as_str())
            .await?;
        if !matches!(auth, client::AuthResult::Success) {
            return Err(Error::AuthRejected(credentials.username.clone()));
        }

        let mut channel = session.channel_open_session().await?;
        channel.exec(true, command).await?;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status } => {
                    if exit_status != 0 {
                        warn!(ip, exit_status, "upload command exited non-zero");
                    }
                }
                ChannelMsg::Data { .. } | ChannelMsg::ExtendedData { .. } => {}
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        session.disconnect(russh::Disconnect::ByApplication, "", "en").await?;
        Ok(())
    }
}
