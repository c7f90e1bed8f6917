//! TCP transport for the sync protocol
//!
//! Accepts connections and spawns a read task and a write task per peer.
//! Read tasks only parse framing and forward raw packets into the session
//! inbox; all validation and dispatch happens on the session's tick, so
//! per-connection processing stays strictly sequential.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::net::framing::{read_frame, FramingError};
use crate::net::inbox::{PacketSender, RawPacket};
use crate::net::session::SessionCommand;

/// Listening TCP server feeding the sync session
pub struct SyncServer {
    listener: TcpListener,
    commands: mpsc::Sender<SessionCommand>,
    inbox: PacketSender,
}

impl SyncServer {
    /// Bind the listening socket
    pub async fn bind(
        config: &ServerConfig,
        commands: mpsc::Sender<SessionCommand>,
        inbox: PacketSender,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(config.bind_address, config.port);
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            commands,
            inbox,
        })
    }

    /// Actual bound address (useful when the port was 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the process shuts down
    pub async fn run(self) -> anyhow::Result<()> {
        info!("sync server listening on {}", self.local_addr()?);

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer_addr, e);
            }

            let commands = self.commands.clone();
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, peer_addr, commands, inbox).await {
                    debug!("connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Register the connection with the session, then pump frames until EOF
async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    commands: mpsc::Sender<SessionCommand>,
    inbox: PacketSender,
) -> anyhow::Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(SessionCommand::Connect {
            outbound: outbound_tx,
            reply: reply_tx,
        })
        .await?;
    let conn_id = reply_rx.await?;
    info!("connection {} accepted from {}", conn_id, peer_addr);

    let (mut reader, mut writer) = socket.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if !inbox.try_submit(RawPacket { conn_id, frame }) {
                    warn!("inbox full, dropping frame from connection {}", conn_id);
                }
            }
            Err(FramingError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(anyhow::Error::from(e)),
        }
    };

    // Whatever ended the read loop, the session gets exactly one notice
    commands
        .send(SessionCommand::Disconnect { conn_id })
        .await
        .ok();
    writer_task.abort();
    result
}
