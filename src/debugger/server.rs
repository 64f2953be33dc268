//! TCP transport for the telnet debugger.
//!
//! A tokio current-thread runtime on its own OS thread accepts one client at
//! a time and bridges it to a [`DebugLink`]. Output queued while nobody is
//! connected is discarded; extra clients are dropped on accept.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, error, info, warn};

use super::link::{DebugLink, LinkEvent, Outgoing};

/// Handle to the running transport thread.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the transport to stop. It stops once every sender of
    /// outbound text (the link and its console taps) has been dropped.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("debugger transport thread panicked");
            }
        }
    }
}

/// Bind `port` on all interfaces and start serving. Port 0 picks a free port.
pub fn spawn_server(port: u16) -> io::Result<(DebugLink, ServerHandle)> {
    let std_listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    std_listener.set_nonblocking(true)?;
    let addr = std_listener.local_addr()?;

    let (event_tx, event_rx) = mpsc::channel();
    let (out_tx, out_rx) = unbounded_channel();

    let thread = thread::Builder::new()
        .name("debugger-net".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("failed to start debugger runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                match TcpListener::from_std(std_listener) {
                    Ok(listener) => serve(listener, event_tx, out_rx).await,
                    Err(e) => error!("failed to register debugger listener: {}", e),
                }
            });
        })?;

    info!("Telnet debugger listening on {}", addr);
    Ok((
        DebugLink::new(event_rx, out_tx),
        ServerHandle {
            addr,
            thread: Some(thread),
        },
    ))
}

async fn serve(listener: TcpListener, events: Sender<LinkEvent>, mut outgoing: UnboundedReceiver<Outgoing>) {
    loop {
        let Some(stream) = wait_for_client(&listener, &mut outgoing).await else {
            debug!("debugger link dropped, stopping transport");
            return;
        };
        if events.send(LinkEvent::Connected).is_err() {
            return;
        }
        let keep_running = handle_connection(stream, &listener, &events, &mut outgoing).await;
        if events.send(LinkEvent::Disconnected).is_err() || !keep_running {
            return;
        }
    }
}

/// Accept the next client, discarding output meant for nobody. Returns
/// `None` once the link side has gone away.
async fn wait_for_client(listener: &TcpListener, outgoing: &mut UnboundedReceiver<Outgoing>) -> Option<TcpStream> {
    let mut error_count = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Debugger client connected from {}", peer);
                    return Some(stream);
                }
                Err(e) => {
                    error!("Failed to accept debugger connection: {}", e);
                    error_count += 1;
                    if error_count > 10 {
                        error!("Too many consecutive accept errors, shutting down debugger transport");
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            msg = outgoing.recv() => {
                if msg.is_none() {
                    return None;
                }
            }
        }
    }
}

/// Pump one client until it leaves or is closed. Returns false when the
/// link side has gone away and the transport should stop.
async fn handle_connection(
    stream: TcpStream,
    listener: &TcpListener,
    events: &Sender<LinkEvent>,
    outgoing: &mut UnboundedReceiver<Outgoing>,
) -> bool {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r').to_string();
                    if events.send(LinkEvent::Line(line)).is_err() {
                        return false;
                    }
                }
                Ok(None) => {
                    info!("Debugger client disconnected");
                    return true;
                }
                Err(e) => {
                    warn!("Debugger connection error: {}", e);
                    return true;
                }
            },
            msg = outgoing.recv() => match msg {
                Some(Outgoing::Line(text)) => {
                    if let Err(e) = writer.write_all(format!("{text}\r\n").as_bytes()).await {
                        warn!("Failed to write to debugger client: {}", e);
                        return true;
                    }
                }
                Some(Outgoing::Close) => {
                    let _ = writer.shutdown().await;
                    info!("Closed debugger client");
                    return true;
                }
                None => return false,
            },
            extra = listener.accept() => {
                if let Ok((_, peer)) = extra {
                    warn!("Rejecting debugger client {}: a session is already active", peer);
                }
            }
        }
    }
}
