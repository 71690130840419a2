//! The BOB command channel: a line-oriented TCP control protocol for
//! provisioning tunnels and keys.
//!
//! Each session reads commands of up to 1024 bytes and replies `OK <msg>`
//! or `ERROR <msg>`. Session state (nickname, keys, endpoints) is private
//! until `start` turns it into a live tunnel in the shared registry:
//!
//! - `inhost`/`inport` configure a client tunnel endpoint; `outhost` then
//!   names the remote destination it bridges to.
//! - `outhost`/`outport` together configure a server tunnel target, hosted
//!   under the session's keys (`newkeys` first).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use allium_netdb::NetDb;
use allium_streaming::StreamingEngine;
use allium_tunnel::{ClientTunnel, ServerTunnel, Tunnel};
use allium_types::PrivateKeys;

/// Longest accepted command line.
pub const COMMAND_BUFFER_SIZE: usize = 1024;

/// The control channel listener and tunnel registry.
#[derive(Clone)]
pub struct BobCommandChannel {
    inner: Arc<BobInner>,
}

struct BobInner {
    port: u16,
    netdb: Arc<NetDb>,
    engine: StreamingEngine,
    tunnels: Mutex<HashMap<String, Tunnel>>,
    shutdown: broadcast::Sender<()>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Per-session provisioning state.
#[derive(Default)]
struct Session {
    nickname: Option<String>,
    keys: Option<PrivateKeys>,
    inhost: Option<String>,
    inport: Option<u16>,
    outhost: Option<String>,
    outport: Option<u16>,
}

impl BobCommandChannel {
    pub fn new(port: u16, netdb: Arc<NetDb>, engine: StreamingEngine) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(BobInner {
                port,
                netdb,
                engine,
                tunnels: Mutex::new(HashMap::new()),
                shutdown,
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Fires when a session issues `zap`.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }

    /// Bind the control listener. Returns the bound address.
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", self.inner.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "BOB command channel listening");
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "BOB session opened");
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.run_session(socket).await {
                                debug!(error = %e, "BOB session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "BOB accept failed");
                        break;
                    }
                }
            }
        });
        *self.inner.accept_task.lock().unwrap() = Some(task);
        Ok(local_addr)
    }

    /// Stop the listener and every registered tunnel.
    pub fn stop(&self) {
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let tunnels: Vec<Tunnel> = {
            let mut map = self.inner.tunnels.lock().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };
        for tunnel in tunnels {
            tunnel.stop();
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.tunnels.lock().unwrap().len()
    }
}

enum Reply {
    Ok(String),
    Error(String),
    /// Reply, then end the session.
    Quit(String),
    /// Reply, then bring the daemon down.
    Zap(String),
}

impl BobInner {
    async fn run_session(&self, socket: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session = Session::default();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            if line.len() > COMMAND_BUFFER_SIZE {
                write_half
                    .write_all(b"ERROR command line too long\n")
                    .await?;
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (command, operand) = match trimmed.split_once(' ') {
                Some((command, operand)) => (command, operand.trim()),
                None => (trimmed, ""),
            };
            let reply = self.handle_command(&mut session, command, operand).await;
            match reply {
                Reply::Ok(msg) => {
                    write_half.write_all(format!("OK {msg}\n").as_bytes()).await?;
                }
                Reply::Error(msg) => {
                    write_half
                        .write_all(format!("ERROR {msg}\n").as_bytes())
                        .await?;
                }
                Reply::Quit(msg) => {
                    write_half.write_all(format!("OK {msg}\n").as_bytes()).await?;
                    return Ok(());
                }
                Reply::Zap(msg) => {
                    write_half.write_all(format!("OK {msg}\n").as_bytes()).await?;
                    let _ = self.shutdown.send(());
                    return Ok(());
                }
            }
        }
    }

    async fn handle_command(&self, session: &mut Session, command: &str, operand: &str) -> Reply {
        match command {
            "zap" => Reply::Zap("shutting down".into()),
            "quit" => Reply::Quit("bye".into()),
            "setnick" => {
                if operand.is_empty() {
                    return Reply::Error("nickname required".into());
                }
                session.nickname = Some(operand.to_string());
                Reply::Ok(format!("nickname {operand} set"))
            }
            "newkeys" => {
                let keys = PrivateKeys::generate();
                let public = keys.ident_hash().to_base64();
                session.keys = Some(keys);
                Reply::Ok(public)
            }
            "outhost" => {
                if operand.is_empty() {
                    return Reply::Error("hostname required".into());
                }
                session.outhost = Some(operand.to_string());
                Reply::Ok("outhost set".into())
            }
            "outport" => match operand.parse::<u16>() {
                Ok(port) => {
                    session.outport = Some(port);
                    Reply::Ok("outport set".into())
                }
                Err(_) => Reply::Error(format!("bad port {operand:?}")),
            },
            "inhost" => {
                if operand.is_empty() {
                    return Reply::Error("hostname required".into());
                }
                session.inhost = Some(operand.to_string());
                Reply::Ok("inhost set".into())
            }
            "inport" => match operand.parse::<u16>() {
                Ok(port) => {
                    session.inport = Some(port);
                    Reply::Ok("inport set".into())
                }
                Err(_) => Reply::Error(format!("bad port {operand:?}")),
            },
            "start" => self.start_tunnel(session).await,
            other => Reply::Error(format!("unknown command {other:?}")),
        }
    }

    async fn start_tunnel(&self, session: &mut Session) -> Reply {
        let Some(nickname) = session.nickname.clone() else {
            return Reply::Error("no nickname, use setnick first".into());
        };
        if self.tunnels.lock().unwrap().contains_key(&nickname) {
            return Reply::Error(format!("tunnel {nickname} already exists"));
        }

        if let (Some(outhost), Some(outport)) = (session.outhost.clone(), session.outport) {
            // Server tunnel: host the session's keys, forward to the target.
            let Some(keys) = session.keys.clone() else {
                return Reply::Error("no keys, use newkeys first".into());
            };
            let destination = self.engine.add_destination(keys, true);
            let tunnel = ServerTunnel::new(outhost, outport, destination);
            tunnel.start();
            self.tunnels
                .lock()
                .unwrap()
                .insert(nickname.clone(), Tunnel::Server(tunnel));
            return Reply::Ok(format!("tunnel {nickname} started"));
        }

        if let Some(inport) = session.inport {
            // Client tunnel: listen locally, bridge to the named remote.
            let Some(remote) = session.outhost.clone() else {
                return Reply::Error("no remote destination, use outhost".into());
            };
            let bind_host = session
                .inhost
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let tunnel = ClientTunnel::new(
                remote,
                bind_host,
                inport,
                self.netdb.clone(),
                self.engine.clone(),
            );
            match tunnel.start().await {
                Ok(local_addr) => {
                    self.tunnels
                        .lock()
                        .unwrap()
                        .insert(nickname.clone(), Tunnel::Client(tunnel));
                    Reply::Ok(format!("tunnel {nickname} started on {local_addr}"))
                }
                Err(e) => Reply::Error(format!("cannot start tunnel: {e}")),
            }
        } else {
            Reply::Error("tunnel not configured, set inport or outhost/outport".into())
        }
    }
}
