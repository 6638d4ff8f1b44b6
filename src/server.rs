//! The coordinator: control listener, command fan-out, result aggregation
//! and the discovery beacon.
//!
//! [`Server::bind`] hands back a [`ServerHandle`] the console uses to push
//! commands and observe progress; [`Server::run`] owns the accept loop. Each
//! accepted agent becomes a [`crate::peer::run_peer`] task reached through a
//! per-peer command channel — all peer mutation stays inside that task, so
//! the server itself only routes messages.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};

use crate::command::Command;
use crate::peer::{run_peer, PeerEvent, SetCommand};
use crate::socket::{bind_data_socket, multicast_target};
use crate::stats::NetStat;
use crate::{DATA_MULTICAST_PORT, NOTIFY_INTERVAL, NOTIFY_MULTICAST_GROUP, NOTIFY_PORT};

/// Progress reported to the console.
#[derive(Debug)]
pub enum ServerEvent {
    PeerConnected { cookie: String, peers: usize },
    PeerDisconnected { cookie: String, peers: usize },
    /// One peer finished the in-flight command (`stat` is `None` on failure).
    PeerStopped { cookie: String, stat: Option<NetStat> },
    /// Every peer reported; `stat` is the per-peer average, or `None` when
    /// no peer succeeded.
    CommandFinished { command: Command, stat: Option<NetStat> },
}

/// Console-side handle: push commands, watch peers, read events.
pub struct ServerHandle {
    pub commands: mpsc::Sender<Command>,
    pub events: mpsc::Receiver<ServerEvent>,
    pub peer_count: watch::Receiver<usize>,
    /// Where the control listener actually bound (port 0 resolves here).
    pub local_addr: SocketAddr,
}

struct PeerSlot {
    cookie: String,
    commands: mpsc::Sender<SetCommand>,
}

/// Aggregation state for the command currently in flight.
struct Pending {
    command: Command,
    token: u8,
    waiting: usize,
    succeeded: i64,
    failed: i64,
    total: NetStat,
}

pub struct Server {
    listener: TcpListener,
    bind_ip: IpAddr,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ServerEvent>,
    peer_count: watch::Sender<usize>,
}

impl Server {
    /// Bind the control listener and hand back the console handle.
    pub async fn bind(bind_ip: IpAddr, port: u16) -> Result<(Server, ServerHandle)> {
        let bind = SocketAddr::new(bind_ip, port);
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("binding control listener on {bind}"))?;
        let local_addr = listener.local_addr().context("resolving listener address")?;

        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (count_tx, count_rx) = watch::channel(0);
        let server = Server {
            listener,
            bind_ip,
            commands: command_rx,
            events: event_tx,
            peer_count: count_tx,
        };
        let handle = ServerHandle {
            commands: command_tx,
            events: event_rx,
            peer_count: count_rx,
            local_addr,
        };
        Ok((server, handle))
    }

    /// Accept agents and fan commands out to them until the console closes
    /// the command channel.
    pub async fn run(mut self) -> Result<()> {
        log::info!("[server] listening on {}", self.listener.local_addr()?);

        tokio::spawn(run_notify_beacon(self.bind_ip));

        let (peer_event_tx, mut peer_event_rx) = mpsc::channel::<PeerEvent>(64);
        let mut peers: Vec<PeerSlot> = Vec::new();
        let mut multicast_sock: Option<Arc<UdpSocket>> = None;
        let mut pending: Option<Pending> = None;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted.context("accepting control connection")?;
                    let cookie = addr.to_string();
                    let (cmd_tx, cmd_rx) = mpsc::channel(4);
                    tokio::spawn(run_peer(stream, cmd_rx, peer_event_tx.clone()));
                    peers.push(PeerSlot { cookie: cookie.clone(), commands: cmd_tx });
                    self.peer_count.send_replace(peers.len());
                    log::info!("[server] peer connected: {cookie} ({} total)", peers.len());
                    let _ = self.events
                        .send(ServerEvent::PeerConnected { cookie, peers: peers.len() })
                        .await;
                }

                queued = self.commands.recv() => {
                    let Some(command) = queued else { break };
                    self.dispatch(command, &peers, &mut multicast_sock, &mut pending).await;
                }

                Some(event) = peer_event_rx.recv() => {
                    match event {
                        PeerEvent::Stopped { cookie, token, stat } => {
                            self.collect(cookie, token, stat, &mut pending).await;
                        }
                        PeerEvent::Disconnected { cookie } => {
                            peers.retain(|p| p.cookie != cookie);
                            self.peer_count.send_replace(peers.len());
                            log::info!(
                                "[server] peer disconnected: {cookie} ({} left)",
                                peers.len()
                            );
                            let _ = self.events
                                .send(ServerEvent::PeerDisconnected { cookie, peers: peers.len() })
                                .await;
                        }
                    }
                }
            }
        }
        log::info!("[server] console closed, shutting down");
        Ok(())
    }

    /// Fan one measurement command out to every connected peer.
    async fn dispatch(
        &mut self,
        command: Command,
        peers: &[PeerSlot],
        multicast_sock: &mut Option<Arc<UdpSocket>>,
        pending: &mut Option<Pending>,
    ) {
        let (is_multicast, token) = match command.traffic() {
            Some(params) => (params.multicast, params.token),
            None => {
                log::warn!("[server] not a measurement command: {command}");
                return;
            }
        };
        if pending.is_some() {
            log::warn!("[server] command already in flight, refusing: {command}");
            let _ = self.events
                .send(ServerEvent::CommandFinished { command, stat: None })
                .await;
            return;
        }
        if peers.is_empty() {
            log::warn!("[server] no peers connected for: {command}");
            let _ = self.events
                .send(ServerEvent::CommandFinished { command, stat: None })
                .await;
            return;
        }

        let multicast = if is_multicast {
            match shared_multicast(multicast_sock).await {
                Ok((sock, target)) => Some((sock, target)),
                Err(e) => {
                    log::error!("[server] multicast socket unavailable: {e}");
                    let _ = self.events
                        .send(ServerEvent::CommandFinished { command, stat: None })
                        .await;
                    return;
                }
            }
        } else {
            None
        };

        let mut waiting = 0;
        for peer in peers {
            let set = SetCommand { command: command.clone(), multicast: multicast.clone() };
            if peer.commands.send(set).await.is_ok() {
                waiting += 1;
            }
        }
        log::info!("[server] dispatched to {waiting} peer(s): {command}");
        *pending = Some(Pending {
            command,
            token,
            waiting,
            succeeded: 0,
            failed: 0,
            total: NetStat::default(),
        });
    }

    /// Account one peer's report; close out the command when all are in.
    async fn collect(
        &mut self,
        cookie: String,
        token: u8,
        stat: Option<NetStat>,
        pending: &mut Option<Pending>,
    ) {
        let Some(current) = pending.as_mut() else {
            log::debug!("[server] late report from {cookie} ignored");
            return;
        };
        if current.token != token {
            log::debug!("[server] stale report from {cookie} (token {})", token as char);
            return;
        }
        match &stat {
            Some(s) => {
                current.total.merge(s);
                current.succeeded += 1;
            }
            None => current.failed += 1,
        }
        current.waiting = current.waiting.saturating_sub(1);
        let _ = self.events.send(ServerEvent::PeerStopped { cookie, stat }).await;

        if current.waiting == 0 {
            let Some(Pending { command, succeeded, failed, total, .. }) = pending.take() else {
                return;
            };
            let stat = (succeeded > 0).then(|| {
                let mut avg = total.averaged(succeeded);
                avg.peers_count = succeeded + failed;
                avg.peers_failed = failed;
                avg
            });
            let _ = self.events
                .send(ServerEvent::CommandFinished { command, stat })
                .await;
        }
    }
}

/// The multicast data socket shared by every peer, created on first use.
/// It sends from an ephemeral port; agents listen on the fixed group port.
async fn shared_multicast(
    slot: &mut Option<Arc<UdpSocket>>,
) -> std::io::Result<(Arc<UdpSocket>, SocketAddr)> {
    let sock = match slot {
        Some(sock) => sock.clone(),
        None => {
            let fresh = Arc::new(bind_data_socket().await?);
            *slot = Some(fresh.clone());
            fresh
        }
    };
    Ok((sock, multicast_target(DATA_MULTICAST_PORT)))
}

/// Announce the coordinator's address to the discovery group every few
/// seconds so agents on the segment can find it.
async fn run_notify_beacon(bind_ip: IpAddr) {
    let sock = match bind_data_socket().await {
        Ok(sock) => sock,
        Err(e) => {
            log::warn!("[notify] beacon disabled: {e}");
            return;
        }
    };
    let target = SocketAddr::from((NOTIFY_MULTICAST_GROUP, NOTIFY_PORT));
    let payload = bind_ip.to_string();
    loop {
        if let Err(e) = sock.send_to(payload.as_bytes(), target).await {
            log::debug!("[notify] beacon send failed: {e}");
        }
        tokio::time::sleep(NOTIFY_INTERVAL).await;
    }
}
