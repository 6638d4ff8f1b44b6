//! End-to-end echo measurements over loopback.
//!
//! Each test spins a coordinator and one or more agents up in-process and
//! drives them through the console-facing [`ServerHandle`], asserting on the
//! aggregated statistics. Both sides are spawned as separate tokio tasks so
//! they can make progress concurrently.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use netsnoop::client;
use netsnoop::command::{parse_command, ChannelMode, Command};
use netsnoop::server::{Server, ServerEvent, ServerHandle};
use netsnoop::socket::{bind_data_socket, ControlChannel};
use netsnoop::NetStat;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_coordinator() -> ServerHandle {
    let (server, handle) = Server::bind(LOCALHOST, 0).await.expect("bind coordinator");
    tokio::spawn(server.run());
    handle
}

async fn wait_for_peers(counter: &mut watch::Receiver<usize>, wanted: usize) {
    timeout(Duration::from_secs(5), async {
        while *counter.borrow_and_update() < wanted {
            counter.changed().await.expect("server alive");
        }
    })
    .await
    .expect("agents connected in time");
}

/// Drain events until the in-flight command completes.
async fn next_finish(events: &mut mpsc::Receiver<ServerEvent>) -> (Command, Option<NetStat>) {
    loop {
        match timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Some(ServerEvent::CommandFinished { command, stat })) => return (command, stat),
            Ok(Some(_)) => continue,
            Ok(None) => panic!("server event stream closed early"),
            Err(_) => panic!("timed out waiting for command completion"),
        }
    }
}

// ---------------------------------------------------------------------------
// Test 1: lossless round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_measures_lossless_roundtrip() {
    let mut handle = start_coordinator().await;
    let addr = handle.local_addr;
    tokio::spawn(client::run(addr.ip(), addr.port()));
    wait_for_peers(&mut handle.peer_count, 1).await;

    let command = parse_command("ping count 5 interval 20 size 64 wait 200 timeout 2000").unwrap();
    handle.commands.send(command).await.unwrap();

    let (_, stat) = next_finish(&mut handle.events).await;
    let stat = stat.expect("lossless link yields a result");
    assert_eq!(stat.send_packets, 5);
    assert_eq!(stat.recv_packets, 5);
    assert_eq!(stat.loss, 0.0);
    assert!(stat.min_delay <= stat.delay && stat.delay <= stat.max_delay);
    assert!(stat.jitter_std >= 0);
    assert_eq!(stat.illegal_packets, 0);
    assert_eq!(stat.peers_count, 1);
    assert_eq!(stat.peers_failed, 0);
}

// ---------------------------------------------------------------------------
// Test 2: back-to-back commands reuse the idle session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_returns_to_idle_between_commands() {
    let mut handle = start_coordinator().await;
    let addr = handle.local_addr;
    tokio::spawn(client::run(addr.ip(), addr.port()));
    wait_for_peers(&mut handle.peer_count, 1).await;

    for _ in 0..2 {
        let command =
            parse_command("ping count 2 interval 10 size 32 wait 100 timeout 2000").unwrap();
        handle.commands.send(command).await.unwrap();
        let (_, stat) = next_finish(&mut handle.events).await;
        let stat = stat.expect("command succeeds");
        assert_eq!(stat.send_packets, 2);
        assert_eq!(stat.recv_packets, 2);
    }
}

// ---------------------------------------------------------------------------
// Test 3: an unresponsive agent fails alone
// ---------------------------------------------------------------------------

/// A scripted half-agent: negotiates the data channel and acks the command,
/// but never answers `stop` — the coordinator's result wait must expire.
async fn run_silent_agent(addr: std::net::SocketAddr) {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut ctrl = ControlChannel::new(stream).expect("control channel");
    // keep the data socket alive so probe packets have somewhere to land
    let mut data = None;
    loop {
        match ctrl.read_command().await {
            Ok(Command::Mode { mode: ChannelMode::Udp, port }) => {
                let sock = bind_data_socket().await.expect("bind data");
                sock.connect((addr.ip(), port)).await.expect("connect data");
                let local_port = sock.local_addr().expect("local addr").port();
                data = Some(sock);
                ctrl.write_command(&Command::Mode { mode: ChannelMode::Udp, port: local_port })
                    .await
                    .expect("mode reply");
            }
            Ok(Command::Ping(_) | Command::Send(_)) => {
                ctrl.write_command(&Command::Ack).await.expect("ack");
            }
            Ok(Command::Stop) => { /* stay silent: no result */ }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    drop(data);
}

#[tokio::test]
async fn unresponsive_agent_times_out_without_blocking_others() {
    let mut handle = start_coordinator().await;
    let addr = handle.local_addr;
    tokio::spawn(client::run(addr.ip(), addr.port()));
    tokio::spawn(run_silent_agent(addr));
    wait_for_peers(&mut handle.peer_count, 2).await;

    let command = parse_command("ping count 2 interval 10 size 32 wait 50 timeout 500").unwrap();
    handle.commands.send(command).await.unwrap();

    let mut per_peer: Vec<Option<NetStat>> = Vec::new();
    let finished = loop {
        match timeout(Duration::from_secs(10), handle.events.recv()).await {
            Ok(Some(ServerEvent::PeerStopped { stat, .. })) => per_peer.push(stat),
            Ok(Some(ServerEvent::CommandFinished { stat, .. })) => break stat,
            Ok(Some(_)) => continue,
            other => panic!("unexpected event stream end: {other:?}"),
        }
    };

    assert_eq!(per_peer.len(), 2);
    assert_eq!(per_peer.iter().filter(|s| s.is_some()).count(), 1);
    assert_eq!(per_peer.iter().filter(|s| s.is_none()).count(), 1);

    let stat = finished.expect("the healthy agent still reports");
    assert_eq!(stat.peers_count, 2);
    assert_eq!(stat.peers_failed, 1);
    assert_eq!(stat.send_packets, 2, "failed peer contributes nothing");
}
