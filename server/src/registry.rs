//! Server connection registry (C4): accepts connections, dispatches by
//! identifier byte, and runs each client's control-plane FSM.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use proto::{ConnKind, ControlMessage};
use tracing::{error, info, warn};

use crate::encode::Scheduler;
use crate::ingest::{self, IngestConfig};
use crate::live::LiveSurface;

pub struct ClientSession {
    pub peer: String,
    ctrl_writer: Mutex<TcpStream>,
    stream_conn: Mutex<Option<TcpStream>>,
    resolution: Mutex<(u16, u16)>,
    fps: Mutex<u16>,
    pub running: Arc<AtomicBool>,
    cut: Arc<AtomicBool>,
    ingest_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientSession {
    pub fn set_resolution(&self, height: u16, width: u16) {
        *self.resolution.lock() = (height, width);
    }

    pub fn set_fps(&self, fps: u16) {
        *self.fps.lock() = fps;
    }

    /// Raises this session's cut flag; the ingest writer closes the
    /// current segment and starts a new one the next time it checks.
    pub fn request_cut(&self) {
        self.cut.store(true, Ordering::SeqCst);
    }

    /// Sends the `q` byte requesting client shutdown, per §4.10. The
    /// client's `0x00` reply decodes as `ControlMessage::Stop`, which the
    /// control FSM's normal Stop handling tears the ingest pipeline down
    /// for; the client then closes its sockets, which the FSM observes as
    /// EOF and uses to remove the session from the registry.
    pub fn send_shutdown(&self) -> std::io::Result<()> {
        let mut w = self.ctrl_writer.lock();
        ControlMessage::Shutdown.write_to(&mut *w)
    }
}

#[derive(Clone)]
pub struct Registry {
    sessions: Arc<Mutex<HashMap<String, Arc<ClientSession>>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, peer: &str) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(peer).cloned()
    }

    pub fn remove(&self, peer: &str) {
        self.sessions.lock().remove(peer);
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Every control connection currently registered, for the clock
    /// scheduler's `ClientStoppingPoint` broadcast.
    pub fn all_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.lock().values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[derive(Clone)]
pub struct ServerContext {
    pub root: std::path::PathBuf,
    pub default_height: u16,
    pub default_width: u16,
    pub output_opts: String,
    pub output_ext: String,
    pub live: LiveSurface,
    pub scheduler: Arc<Scheduler>,
    pub clocks: Arc<dyn base::clock::Clocks>,
}

/// Accepts connections until `shutdown` fires. Each connection is handled
/// on its own thread once dispatched; the accept loop itself never blocks
/// on per-client work.
pub fn accept_loop(
    listener: TcpListener,
    registry: Registry,
    ctx: ServerContext,
    shutdown: base::shutdown::Receiver,
) {
    loop {
        if shutdown.is_shutdown() {
            return;
        }
        let (mut conn, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = addr.to_string();
        let kind = match ConnKind::read_from(&mut conn) {
            Ok(k) => k,
            Err(e) => {
                warn!(peer = %peer, error = %e, "rejecting connection with unknown identifier byte");
                continue;
            }
        };
        match kind {
            ConnKind::Management => {
                let ctrl_writer = match conn.try_clone() {
                    Ok(c) => c,
                    Err(e) => {
                        error!(peer = %peer, error = %e, "failed to clone control connection");
                        continue;
                    }
                };
                let session = Arc::new(ClientSession {
                    peer: peer.clone(),
                    ctrl_writer: Mutex::new(ctrl_writer),
                    stream_conn: Mutex::new(None),
                    resolution: Mutex::new((ctx.default_height, ctx.default_width)),
                    fps: Mutex::new(0),
                    running: Arc::new(AtomicBool::new(false)),
                    cut: Arc::new(AtomicBool::new(false)),
                    ingest_threads: Mutex::new(Vec::new()),
                });
                registry.sessions.lock().insert(peer.clone(), session.clone());
                info!(peer = %peer, "registered management connection");

                let registry = registry.clone();
                let ctx = ctx.clone();
                std::thread::Builder::new()
                    .name(format!("ctrl-fsm-{peer}"))
                    .spawn(move || control_fsm(conn, session, registry, ctx))
                    .expect("spawning control fsm thread");
            }
            ConnKind::Camera => match registry.get(&peer) {
                Some(session) => {
                    *session.stream_conn.lock() = Some(conn);
                    info!(peer = %peer, "attached stream connection");
                }
                None => {
                    warn!(peer = %peer, "stream connection with no prior management connection; discarding");
                }
            },
        }
    }
}

fn control_fsm(mut ctrl: TcpStream, session: Arc<ClientSession>, registry: Registry, ctx: ServerContext) {
    loop {
        match ControlMessage::read_from(&mut ctrl) {
            Ok(ControlMessage::GetResolution) => {
                let mut w = session.ctrl_writer.lock();
                if let Err(e) =
                    proto::write_resolution_reply(&mut *w, ctx.default_height, ctx.default_width)
                {
                    warn!(peer = %session.peer, error = %e, "failed to reply to gr");
                }
            }
            Ok(ControlMessage::SetResolution { height, width }) => {
                session.set_resolution(height, width);
            }
            Ok(ControlMessage::SetFps { fps }) => {
                session.set_fps(fps as u16);
            }
            Ok(ControlMessage::Start) => handle_start(&session, &ctx),
            Ok(ControlMessage::Stop) => handle_stop(&session, &ctx),
            Ok(ControlMessage::Shutdown) => {
                // `q` only ever flows server to client; seeing it the other
                // way is a malformed peer. Ignore and keep reading.
                warn!(peer = %session.peer, "received shutdown byte from client; ignoring");
            }
            Err(e) => {
                info!(peer = %session.peer, error = %e, "control connection closed");
                handle_stop(&session, &ctx);
                registry.remove(&session.peer);
                ctx.live.remove(&session.peer);
                return;
            }
        }
    }
}

fn handle_start(session: &Arc<ClientSession>, ctx: &ServerContext) {
    let Some(stream_conn) = session.stream_conn.lock().take() else {
        warn!(peer = %session.peer, "start requested with no stream connection attached");
        return;
    };
    session.running.store(true, Ordering::SeqCst);
    let (height, width) = *session.resolution.lock();
    let fps = *session.fps.lock();
    let cfg = IngestConfig {
        root: ctx.root.clone(),
        peer: session.peer.clone(),
        width,
        height,
        fps,
        output_opts: ctx.output_opts.clone(),
        output_ext: ctx.output_ext.clone(),
    };
    let (reader, writer) = ingest::spawn(
        stream_conn,
        cfg,
        session.running.clone(),
        session.cut.clone(),
        ctx.live.clone(),
        ctx.scheduler.clone(),
        ctx.clocks.clone(),
    );
    *session.ingest_threads.lock() = vec![reader, writer];

    let mut w = session.ctrl_writer.lock();
    if let Err(e) = ControlMessage::Start.write_to(&mut *w) {
        warn!(peer = %session.peer, error = %e, "failed to acknowledge start");
    }
}

fn handle_stop(session: &Arc<ClientSession>, ctx: &ServerContext) {
    session.running.store(false, Ordering::SeqCst);
    let threads: Vec<_> = session.ingest_threads.lock().drain(..).collect();
    for t in threads {
        let _ = t.join();
    }
    ctx.live.remove(&session.peer);
}
