//! Embedded SSH endpoint terminating device uploads.
//!
//! Authentication is a formality: any username with any password or public
//! key is accepted, because the secret that matters was already validated on
//! the PLC trigger. Every authenticated session is chroot-ed to `/` of the
//! shared [`VirtualFs`]; the SFTP subsystem itself lives in
//! [`handler::SftpSession`].

mod handler;


pub use handler::SftpSession;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{Auth, Msg, Server, Session};
use russh::{Channel, ChannelId};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bus::EventBus;
use crate::vfs::VirtualFs;

/// Start-up failures of the SFTP endpoint; both abort the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot load host key {}: {source}", .path.display())]
    HostKey { path: PathBuf, source: russh::keys::Error },
    #[error("cannot bind sftp endpoint: {0}")]
    Bind(#[from] std::io::Error),
}

/// The embedded SSH/SFTP server.
pub struct SftpServer {
    host: String,
    port: u16,
    host_key: PathBuf,
    fs: Arc<VirtualFs>,
    bus: Arc<EventBus>,
}

impl SftpServer {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        host_key: impl Into<PathBuf>,
        fs: Arc<VirtualFs>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { host: host.into(), port, host_key: host_key.into(), fs, bus }
    }

    /// Loads the host key, binds the endpoint and spawns the accept loop.
    /// Key-load and bind failures propagate as start-up failures.
    pub async fn spawn(self) -> Result<JoinHandle<()>, Error> {
        let key = russh::keys::load_secret_key(&self.host_key, None)
            .map_err(|source| Error::HostKey { path: self.host_key.clone(), source })?;
        let config = Arc::new(russh::server::Config {
            keys: vec![key],
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..russh::server::Config::default()
        });

        let socket = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!(addr = %socket.local_addr()?, "sftp endpoint up");

        let mut acceptor = Acceptor { fs: self.fs, bus: self.bus };
        Ok(tokio::spawn(async move {
            if let Err(err) = acceptor.run_on_socket(config, &socket).await {
                error!(%err, "sftp accept loop terminated");
            }
        }))
    }
}

struct Acceptor {
    fs: Arc<VirtualFs>,
    bus: Arc<EventBus>,
}

impl Server for Acceptor {
    type Handler = SshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshSession {
        info!(?peer, "ssh connection received");
        SshSession { fs: self.fs.clone(), bus: self.bus.clone(), channels: HashMap::new() }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!(%error, "ssh session error");
    }
}

/// One SSH connection: `Connecting → Authenticating → Authenticated →
/// SFTPSession → Closed`, with transport errors closing it at any point.
pub struct SshSession {
    fs: Arc<VirtualFs>,
    bus: Arc<EventBus>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl russh::server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!(user, "password auth accepted");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user, "publickey auth accepted");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            debug!(name, "unsupported subsystem refused");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        match self.channels.remove(&channel_id) {
            Some(channel) => {
                session.channel_success(channel_id)?;
                let sftp = SftpSession::new(self.fs.clone(), self.bus.clone());
                tokio::spawn(async move {
                    russh_sftp::server::run(channel.into_stream(), sftp).await;
                    debug!("sftp session ended");
                });
            }
            None => session.channel_failure(channel_id)?,
        }
        Ok(())
    }
}
