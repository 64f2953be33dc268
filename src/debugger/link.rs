//! Channel pair between the debugger and its transport.
//!
//! The interpreter side polls inbound events without blocking; outbound text
//! goes through a tokio channel so the network task can `await` it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Something that happened on the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    /// One protocol line, terminator stripped.
    Line(String),
    Disconnected,
}

/// Text for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Line(String),
    /// Drop the current client after everything queued before it is sent.
    Close,
}

/// The debugger's end of the link.
#[derive(Debug)]
pub struct DebugLink {
    events: Receiver<LinkEvent>,
    outgoing: UnboundedSender<Outgoing>,
    echo: Arc<AtomicBool>,
}

impl DebugLink {
    pub fn new(events: Receiver<LinkEvent>, outgoing: UnboundedSender<Outgoing>) -> Self {
        Self {
            events,
            outgoing,
            echo: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An in-memory link and the peer that drives it.
    pub fn pair() -> (DebugLink, DebugPeer) {
        let (event_tx, event_rx) = mpsc::channel();
        let (out_tx, out_rx) = unbounded_channel();
        (
            DebugLink::new(event_rx, out_tx),
            DebugPeer {
                events: event_tx,
                outgoing: out_rx,
            },
        )
    }

    pub fn try_recv(&self) -> Result<LinkEvent, TryRecvError> {
        self.events.try_recv()
    }

    pub fn send_line(&self, line: impl Into<String>) {
        // The transport may already be gone; there is nobody left to tell.
        let _ = self.outgoing.send(Outgoing::Line(line.into()));
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    /// Turn `COUT` mirroring on or off.
    pub fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::Relaxed);
    }

    pub fn tap(&self) -> ConsoleTap {
        ConsoleTap {
            outgoing: self.outgoing.clone(),
            echo: self.echo.clone(),
        }
    }
}

/// Mirrors console output to an authenticated client as `COUT` lines.
#[derive(Debug, Clone)]
pub struct ConsoleTap {
    outgoing: UnboundedSender<Outgoing>,
    echo: Arc<AtomicBool>,
}

impl ConsoleTap {
    pub fn send(&self, text: &str) {
        if self.echo.load(Ordering::Relaxed) {
            let _ = self.outgoing.send(Outgoing::Line(format!("COUT {text}")));
        }
    }
}

/// The client side of an in-memory link.
#[derive(Debug)]
pub struct DebugPeer {
    events: Sender<LinkEvent>,
    outgoing: UnboundedReceiver<Outgoing>,
}

impl DebugPeer {
    pub fn connect(&self) {
        let _ = self.events.send(LinkEvent::Connected);
    }

    pub fn send(&self, line: &str) {
        let _ = self.events.send(LinkEvent::Line(line.to_string()));
    }

    pub fn disconnect(&self) {
        let _ = self.events.send(LinkEvent::Disconnected);
    }

    /// Everything sent to the client so far.
    pub fn received(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outgoing.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Received text lines, without close markers.
    pub fn lines(&mut self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|msg| match msg {
                Outgoing::Line(line) => Some(line),
                Outgoing::Close => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_both_ways() {
        let (link, mut peer) = DebugLink::pair();
        peer.connect();
        peer.send("hello");
        assert_eq!(link.try_recv(), Ok(LinkEvent::Connected));
        assert_eq!(link.try_recv(), Ok(LinkEvent::Line("hello".into())));
        assert_eq!(link.try_recv(), Err(TryRecvError::Empty));

        link.send_line("PASS Connected.");
        link.close();
        assert_eq!(
            peer.received(),
            vec![Outgoing::Line("PASS Connected.".into()), Outgoing::Close]
        );
    }

    #[test]
    fn test_tap_respects_echo() {
        let (link, mut peer) = DebugLink::pair();
        let tap = link.tap();
        tap.send("hidden");
        link.set_echo(true);
        tap.send("shown");
        assert_eq!(peer.lines(), vec!["COUT shown"]);
    }

    #[test]
    fn test_dropped_peer_reports_disconnect() {
        let (link, peer) = DebugLink::pair();
        drop(peer);
        assert_eq!(link.try_recv(), Err(TryRecvError::Disconnected));
        link.send_line("nobody listening");
    }
}
