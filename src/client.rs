//! The agent: connects out to a coordinator and executes its commands.
//!
//! Mirror of the coordinator-side session in [`crate::peer`], with the
//! initial state `Idle`: the agent negotiates a data channel when told to,
//! acknowledges the measurement command, runs the receive-side engine, and
//! answers `stop` with a `result` line carrying its [`NetStat`]. Data
//! packets that arrive before the command is in place are counted as
//! illegal and discarded.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::{TcpStream, UdpSocket};

use crate::command::{ChannelMode, Command};
use crate::receiver::Collector;
use crate::socket::{bind_data_socket, bind_multicast_listener, ChannelError, ControlChannel};
use crate::state::AgentState;
use crate::wall_now_ns;

struct Agent {
    server_ip: IpAddr,
    state: AgentState,
    data: Option<UdpSocket>,
    engine: Option<Collector>,
    /// Datagrams that landed before the command was in place.
    early_packets: i64,
}

/// Connect to the coordinator and serve commands until it hangs up.
pub async fn run(server_ip: IpAddr, port: u16) -> Result<()> {
    let addr = SocketAddr::new(server_ip, port);
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to coordinator {addr}"))?;
    let mut ctrl = ControlChannel::new(stream).context("setting up control channel")?;
    log::info!("[client] connected to {addr}");

    let mut agent = Agent {
        server_ip,
        state: AgentState::Idle,
        data: None,
        engine: None,
        early_packets: 0,
    };
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let step = tokio::select! {
            line = ctrl.read_command() => match line {
                Ok(command) => agent.on_control(&mut ctrl, command).await,
                Err(ChannelError::Closed) => {
                    log::info!("[client] coordinator closed the connection");
                    return Ok(());
                }
                Err(e) => Err(e),
            },
            received = recv_data(&agent.data, &mut buf) => match received {
                Ok(n) => agent.on_datagram(&buf[..n]).await,
                Err(e) => Err(ChannelError::Io(e)),
            },
        };
        if let Err(e) = step {
            return Err(e).context("agent session failed");
        }
    }
}

/// Receive on the agent's data socket; pends forever while none exists.
async fn recv_data(data: &Option<UdpSocket>, buf: &mut [u8]) -> std::io::Result<usize> {
    match data {
        Some(sock) => sock.recv(buf).await,
        None => std::future::pending().await,
    }
}

impl Agent {
    async fn on_control(
        &mut self,
        ctrl: &mut ControlChannel,
        command: Command,
    ) -> Result<(), ChannelError> {
        match command {
            Command::Mode { mode: ChannelMode::Udp, port } => {
                let sock = bind_data_socket().await?;
                sock.connect((self.server_ip, port)).await?;
                let local_port = sock.local_addr()?.port();
                self.data = Some(sock);
                ctrl.write_command(&Command::Mode { mode: ChannelMode::Udp, port: local_port })
                    .await?;
                self.state = AgentState::Ready;
                log::debug!("[client] unicast data channel ready on port {local_port}");
            }
            Command::Mode { mode: ChannelMode::Multicast, port } => {
                self.data = Some(bind_multicast_listener(port).await?);
                self.state = AgentState::Ready;
                log::debug!("[client] joined data group on port {port}");
            }
            measurement @ (Command::Ping(_) | Command::Send(_)) => {
                if self.state == AgentState::Running {
                    log::warn!("[client] command while running, refusing: {measurement}");
                    return Ok(());
                }
                let mut engine = match Collector::for_command(&measurement) {
                    Some(engine) => engine,
                    None => return Ok(()),
                };
                engine.start(wall_now_ns());
                self.engine = Some(engine);
                ctrl.write_command(&Command::Ack).await?;
                self.state = AgentState::Running;
                log::info!("[client] running: {measurement}");
            }
            Command::Stop => {
                let mut stat = match &mut self.engine {
                    Some(engine) => engine.finish(),
                    None => {
                        log::warn!("[client] stop without a running command");
                        Default::default()
                    }
                };
                stat.illegal_packets += self.early_packets;
                log::info!("[client] finished: {stat}");
                ctrl.write_command(&Command::Result(stat)).await?;
                self.reset();
            }
            other => {
                log::warn!("[client] unexpected {} while {}", other.name(), self.state);
            }
        }
        Ok(())
    }

    /// One datagram from the data channel.
    async fn on_datagram(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let Some(engine) = &mut self.engine else {
            // data raced ahead of the command; counts as illegal traffic
            self.early_packets += 1;
            log::debug!("[client] datagram before command ready ({} so far)", self.early_packets);
            return Ok(());
        };
        engine.on_datagram(wall_now_ns(), buf);
        // echo replies go straight back out
        while let Some(reply) = engine.pop_echo() {
            if let Some(sock) = &self.data {
                sock.send(&reply).await?;
            }
        }
        Ok(())
    }

    /// Drop the command state; the data socket goes with it.
    fn reset(&mut self) {
        self.engine = None;
        self.data = None;
        self.early_packets = 0;
        self.state = AgentState::Idle;
    }
}
