//! Local port forwarding through an SSH bastion.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{SourceError, TunnelConfig};

struct BastionClient;

#[async_trait]
impl client::Handler for BastionClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(fingerprint = %server_public_key.fingerprint(), "bastion host key");
        Ok(true)
    }
}

/// Forwards `127.0.0.1:<ephemeral>` to `remote_host:remote_port` as seen from the bastion.
pub struct SshTunnel {
    local_addr: SocketAddr,
    session: Arc<Handle<BastionClient>>,
    accept_task: JoinHandle<()>,
}

impl SshTunnel {
    pub async fn open(
        config: &TunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self, SourceError> {
        let tunnel_error = |message: String| SourceError::Tunnel {
            host: config.host.clone(),
            port: config.port,
            message,
        };

        let ssh_config = Arc::new(client::Config::default());
        let mut session = client::connect(
            ssh_config,
            (config.host.as_str(), config.port),
            BastionClient,
        )
        .await
        .map_err(|err| tunnel_error(err.to_string()))?;

        let authenticated = session
            .authenticate_password(config.user.clone(), config.password.clone())
            .await
            .map_err(|err| tunnel_error(err.to_string()))?;
        if !authenticated {
            return Err(SourceError::Auth {
                user: config.user.clone(),
            });
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| tunnel_error(format!("binding local endpoint: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| tunnel_error(format!("reading local endpoint: {err}")))?;

        let session = Arc::new(session);
        let accept_task = tokio::spawn(forward_connections(
            listener,
            Arc::clone(&session),
            remote_host.to_string(),
            remote_port,
        ));

        Ok(Self {
            local_addr,
            session,
            accept_task,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn close(self) {
        self.accept_task.abort();
        if let Err(err) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(%err, "ssh disconnect");
        }
    }
}

async fn forward_connections(
    listener: TcpListener,
    session: Arc<Handle<BastionClient>>,
    remote_host: String,
    remote_port: u16,
) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "tunnel listener stopped");
                return;
            }
        };
        let session = Arc::clone(&session);
        let remote_host = remote_host.clone();
        tokio::spawn(async move {
            let channel = match session
                .channel_open_direct_tcpip(
                    remote_host.as_str(),
                    u32::from(remote_port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(%err, %remote_host, remote_port, "opening direct-tcpip channel");
                    return;
                }
            };
            let mut stream = channel.into_stream();
            if let Err(err) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                debug!(%err, "forwarded connection ended");
            }
        });
    }
}
