//! Coordinator-side per-peer session.
//!
//! Each accepted agent connection becomes one [`run_peer`] task owning the
//! control channel, an optional data socket and the current measurement
//! engine. The task multiplexes four event sources with `tokio::select!`:
//! commands fanned out by the server, inbound control lines, inbound data
//! packets, and the session deadline. The state machine is:
//!
//! ```text
//!  Idle ─cmd─▶ Negotiating ─mode reply─▶ AwaitAck ─ack─▶ Running
//!  Running ─engine done, stop sent─▶ AwaitResult ─result─▶ Idle
//!  any ─deadline / transport error─▶ Failed ─cleanup─▶ Idle
//! ```
//!
//! Failures are local to the peer: the task reports a null result for the
//! in-flight command and the server keeps running every other peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::command::{ChannelMode, Command};
use crate::sender::Probe;
use crate::socket::{bind_data_socket, ChannelError, ControlChannel};
use crate::state::PeerState;
use crate::stats::NetStat;
use crate::wall_now_ns;

/// Sleep target when no deadline is armed.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// A command dispatched to one peer, with the shared multicast socket when
/// the command calls for it.
#[derive(Debug, Clone)]
pub struct SetCommand {
    pub command: Command,
    /// `(socket, group target)` — present only for multicast sends. Unicast
    /// commands bind their own data socket instead.
    pub multicast: Option<(Arc<UdpSocket>, SocketAddr)>,
}

/// What a peer task reports back to the server.
#[derive(Debug)]
pub enum PeerEvent {
    /// The command identified by `token` finished on this peer; `stat` is
    /// `None` when the peer failed or timed out.
    Stopped { cookie: String, token: u8, stat: Option<NetStat> },
    /// The control connection is gone; the task is exiting.
    Disconnected { cookie: String },
}

/// The data half of a session: a connected unicast socket of our own, or
/// the server-wide multicast socket with its group target.
enum DataChannel {
    Owned(UdpSocket),
    Shared { sock: Arc<UdpSocket>, target: SocketAddr },
}

impl DataChannel {
    async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            DataChannel::Owned(sock) => sock.send(buf).await,
            DataChannel::Shared { sock, target } => sock.send_to(buf, *target).await,
        }
    }
}

/// Receive on the peer's own data socket; pends forever when there is
/// nothing to receive on (keeps the select arm inert).
async fn recv_data(data: &Option<DataChannel>, buf: &mut [u8]) -> std::io::Result<usize> {
    match data {
        Some(DataChannel::Owned(sock)) => sock.recv(buf).await,
        _ => std::future::pending().await,
    }
}

struct Peer {
    cookie: String,
    peer_addr: SocketAddr,
    state: PeerState,
    command: Option<Command>,
    engine: Option<Probe>,
    data: Option<DataChannel>,
    deadline: Option<Instant>,
}

/// Drive one peer session until the agent disconnects or the server drops
/// the command channel.
pub async fn run_peer(
    stream: TcpStream,
    mut cmd_rx: mpsc::Receiver<SetCommand>,
    event_tx: mpsc::Sender<PeerEvent>,
) {
    let mut ctrl = match ControlChannel::new(stream) {
        Ok(ctrl) => ctrl,
        Err(e) => {
            log::error!("[peer] failed to set up control channel: {e}");
            return;
        }
    };
    let mut peer = Peer {
        cookie: ctrl.peer_addr.to_string(),
        peer_addr: ctrl.peer_addr,
        state: PeerState::Idle,
        command: None,
        engine: None,
        data: None,
        deadline: None,
    };
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let sleep_at = peer.deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        let step = tokio::select! {
            set = cmd_rx.recv() => match set {
                // server is gone; nothing left to coordinate
                None => break,
                Some(set) => peer.apply_command(&mut ctrl, set, &event_tx).await,
            },
            line = ctrl.read_command() => match line {
                Ok(command) => peer.on_control(&mut ctrl, command, &event_tx).await,
                Err(e) => Err(e),
            },
            received = recv_data(&peer.data, &mut buf) => match received {
                Ok(n) => {
                    peer.on_datagram(&buf[..n]);
                    Ok(())
                }
                Err(e) => Err(ChannelError::Io(e)),
            },
            _ = tokio::time::sleep_until(sleep_at), if peer.deadline.is_some() => {
                peer.on_deadline(&mut ctrl, &event_tx).await
            }
        };

        if let Err(e) = step {
            match e {
                ChannelError::Closed => log::info!("[peer {}] agent closed connection", peer.cookie),
                e => log::warn!("[peer {}] transport error: {e}", peer.cookie),
            }
            peer.abort_inflight(&event_tx).await;
            let _ = event_tx
                .send(PeerEvent::Disconnected { cookie: peer.cookie.clone() })
                .await;
            return;
        }
    }
}

impl Peer {
    /// Start a new command. Refused (with a null report) unless idle.
    async fn apply_command(
        &mut self,
        ctrl: &mut ControlChannel,
        set: SetCommand,
        event_tx: &mpsc::Sender<PeerEvent>,
    ) -> Result<(), ChannelError> {
        let token = set.command.traffic().map_or(b'?', |p| p.token);
        if !self.state.accepts_command() {
            log::warn!(
                "[peer {}] refusing command while {}: {}",
                self.cookie,
                self.state,
                set.command
            );
            self.report(event_tx, token, None).await;
            return Ok(());
        }

        let timeout_ms = set.command.traffic().map_or(0, |p| p.timeout_ms);
        match set.multicast {
            Some((sock, target)) => {
                ctrl.write_command(&Command::Mode {
                    mode: ChannelMode::Multicast,
                    port: target.port(),
                })
                .await?;
                self.data = Some(DataChannel::Shared { sock, target });
                ctrl.write_command(&set.command).await?;
                self.state = PeerState::AwaitAck;
            }
            None => {
                let sock = match bind_data_socket().await {
                    Ok(sock) => sock,
                    Err(e) => return Err(ChannelError::Io(e)),
                };
                let port = sock.local_addr()?.port();
                self.data = Some(DataChannel::Owned(sock));
                ctrl.write_command(&Command::Mode { mode: ChannelMode::Udp, port }).await?;
                self.state = PeerState::Negotiating;
            }
        }
        self.command = Some(set.command);
        self.deadline = Some(deadline_after_ms(timeout_ms));
        Ok(())
    }

    /// Handle one inbound control line against the current state.
    async fn on_control(
        &mut self,
        ctrl: &mut ControlChannel,
        received: Command,
        event_tx: &mpsc::Sender<PeerEvent>,
    ) -> Result<(), ChannelError> {
        match (self.state, received) {
            (PeerState::Negotiating, Command::Mode { port, .. }) => {
                // the agent's data endpoint: aim our socket at it
                if let Some(DataChannel::Owned(sock)) = &self.data {
                    sock.connect((self.peer_addr.ip(), port)).await?;
                }
                let command = match &self.command {
                    Some(command) => command.clone(),
                    None => return Ok(()),
                };
                ctrl.write_command(&command).await?;
                self.state = PeerState::AwaitAck;
                self.deadline = Some(deadline_after_ms(self.timeout_ms()));
            }
            (PeerState::AwaitAck, Command::Ack) => {
                let Some(command) = &self.command else { return Ok(()) };
                let mut engine = match Probe::for_command(command) {
                    Some(engine) => engine,
                    None => return Ok(()),
                };
                let now = wall_now_ns();
                engine.start(now);
                self.deadline = engine.next_deadline_ns().map(deadline_at_ns);
                self.engine = Some(engine);
                self.state = PeerState::Running;
                log::debug!("[peer {}] running: {}", self.cookie, command);
            }
            (PeerState::AwaitResult, Command::Result(remote)) => {
                let stat = self
                    .engine
                    .as_ref()
                    .map(|engine| merge_result(self.command.as_ref(), engine.finish(), &remote));
                let token = self.current_token();
                self.clear();
                self.report(event_tx, token, stat).await;
            }
            (state, received) => {
                log::warn!(
                    "[peer {}] unexpected {} while {state}",
                    self.cookie,
                    received.name()
                );
            }
        }
        Ok(())
    }

    /// A datagram came back on the data channel (echo replies).
    fn on_datagram(&mut self, buf: &[u8]) {
        match (&mut self.engine, self.state) {
            (Some(engine), PeerState::Running) => engine.on_datagram(wall_now_ns(), buf),
            _ => log::debug!(
                "[peer {}] dropping datagram outside a running command",
                self.cookie
            ),
        }
    }

    /// The armed deadline fired: either an engine tick or a protocol timeout.
    async fn on_deadline(
        &mut self,
        ctrl: &mut ControlChannel,
        event_tx: &mpsc::Sender<PeerEvent>,
    ) -> Result<(), ChannelError> {
        match self.state {
            PeerState::Running => {
                let now = wall_now_ns();
                let timeout_ms = self.timeout_ms();
                let Some(engine) = &mut self.engine else {
                    self.deadline = None;
                    return Ok(());
                };
                while let Some(pkt) = engine.on_tick(now) {
                    if let Some(data) = &self.data {
                        data.send(&pkt).await?;
                    }
                }
                if engine.is_complete(now) {
                    ctrl.write_command(&Command::Stop).await?;
                    self.state = PeerState::AwaitResult;
                    self.deadline = Some(deadline_after_ms(timeout_ms));
                } else {
                    self.deadline = engine.next_deadline_ns().map(deadline_at_ns);
                }
            }
            PeerState::Negotiating | PeerState::AwaitAck | PeerState::AwaitResult => {
                log::warn!(
                    "[peer {}] timed out while {} for {:?}",
                    self.cookie,
                    self.state,
                    self.command.as_ref().map(|c| c.name())
                );
                self.state = PeerState::Failed;
                let token = self.current_token();
                self.clear();
                self.report(event_tx, token, None).await;
            }
            PeerState::Idle | PeerState::Failed => self.deadline = None,
        }
        Ok(())
    }

    /// Report a null result for any in-flight command (used on disconnect).
    async fn abort_inflight(&mut self, event_tx: &mpsc::Sender<PeerEvent>) {
        if self.state != PeerState::Idle {
            let token = self.current_token();
            self.clear();
            self.report(event_tx, token, None).await;
        }
    }

    async fn report(
        &self,
        event_tx: &mpsc::Sender<PeerEvent>,
        token: u8,
        stat: Option<NetStat>,
    ) {
        let _ = event_tx
            .send(PeerEvent::Stopped { cookie: self.cookie.clone(), token, stat })
            .await;
    }

    fn current_token(&self) -> u8 {
        self.command
            .as_ref()
            .and_then(|c| c.traffic())
            .map_or(b'?', |p| p.token)
    }

    fn timeout_ms(&self) -> i64 {
        self.command
            .as_ref()
            .and_then(|c| c.traffic())
            .map_or(0, |p| p.timeout_ms)
    }

    /// Release the command, engine and data socket and return to idle.
    fn clear(&mut self) {
        self.command = None;
        self.engine = None;
        self.data = None;
        self.deadline = None;
        self.state = PeerState::Idle;
    }
}

/// Fold the agent's receive-side report into the local send-side stat.
fn merge_result(command: Option<&Command>, local: NetStat, remote: &NetStat) -> NetStat {
    match command {
        // One-way send: the agent measured the receiving half.
        Some(Command::Send(_)) => {
            let mut stat = local;
            stat.recv_packets = remote.recv_packets;
            stat.recv_bytes = remote.recv_bytes;
            stat.recv_time = remote.recv_time;
            stat.recv_speed = remote.recv_speed;
            stat.min_recv_speed = remote.min_recv_speed;
            stat.max_recv_speed = remote.max_recv_speed;
            stat.recv_pps = remote.recv_pps;
            stat.illegal_packets = remote.illegal_packets;
            stat.reorder_packets = remote.reorder_packets;
            stat.duplicate_packets = remote.duplicate_packets;
            stat.timeout_packets = remote.timeout_packets;
            stat.loss = remote.loss;
            stat
        }
        // Round trip: the probe engine measured everything that matters; the
        // agent's counts only confirm the echo half ran.
        _ => {
            log::debug!(
                "[peer] echo agent reports recv {} / echoed {}",
                remote.recv_packets,
                remote.send_packets
            );
            local
        }
    }
}

fn deadline_after_ms(ms: i64) -> Instant {
    Instant::now() + Duration::from_millis(ms.max(0) as u64)
}

/// Convert a wall-clock target on the engine timeline into a tokio deadline.
fn deadline_at_ns(target_ns: i64) -> Instant {
    let remaining = (target_ns - wall_now_ns()).max(0);
    Instant::now() + Duration::from_nanos(remaining as u64)
}
