//! TCP transport: one thread per connection, one JSON object per line.
//!
//! ```text
//! client -> {"type":"join_queue","name":"alice"}
//! server <- {"type":"queue_joined","message":"Waiting for an opponent... (players in queue: 1)"}
//! ```
//!
//! A connection is a player. Reaching the end of the stream, or any read error, is a
//! disconnect. A line that is not UTF-8 only gets an `error` reply.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::channel::{deliver, ClientChannel};
use crate::lobby::{Client, Lobby};
use crate::protocol::ServerEvent;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest accepted inbound line, submissions included.
pub const MAX_FRAME_BYTES: u64 = 1 << 20;

/// Outbound half of a socket.
pub struct TcpChannel {
    stream: Mutex<TcpStream>,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> anyhow::Result<TcpChannel> {
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .context("could not set write timeout")?;
        Ok(TcpChannel {
            stream: Mutex::new(stream),
        })
    }
}

impl ClientChannel for TcpChannel {
    fn send(&self, event: &ServerEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event).context("could not serialize event")?;
        line.push(b'\n');
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&line).context("could not write event")?;
        stream.flush().context("could not flush event")
    }
}

/// Accepts connections forever, each handled on its own thread.
pub fn serve(listener: TcpListener, lobby: Arc<Lobby>) -> anyhow::Result<()> {
    let address = listener.local_addr().context("listener has no local address")?;
    info!(%address, "accepting players");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("could not accept connection: {e}");
                continue;
            }
        };
        let lobby = lobby.clone();
        let spawned = std::thread::Builder::new()
            .name("connection".to_string())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, &lobby) {
                    debug!("connection ended: {e:#}");
                }
            });
        if let Err(e) = spawned {
            warn!("could not spawn connection thread: {e}");
        }
    }
    Ok(())
}

/// Feeds every line read from `stream` to `lobby` until the peer goes away, then disconnects
/// the player.
#[instrument(skip_all, fields(peer = ?stream.peer_addr().ok()))]
pub fn handle_connection(stream: TcpStream, lobby: &Lobby) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream.try_clone().context("could not clone stream")?);
    let channel = Arc::new(TcpChannel::new(stream)?);
    let client = Client::new(&channel);
    info!(participant = %client.id, "connected");

    let result = read_frames(&mut reader, &client, lobby);
    lobby.disconnect(client.id);
    info!(participant = %client.id, "disconnected");
    result
}

fn read_frames(reader: &mut impl BufRead, client: &Client, lobby: &Lobby) -> anyhow::Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(MAX_FRAME_BYTES + 1)
            .read_until(b'\n', &mut line)
            .context("could not read frame")?;
        if read == 0 {
            return Ok(());
        }
        if read as u64 > MAX_FRAME_BYTES {
            deliver(&client.channel, &ServerEvent::error("message too large"));
            anyhow::bail!("frame larger than {MAX_FRAME_BYTES} bytes");
        }
        let Ok(frame) = std::str::from_utf8(&line) else {
            debug!(participant = %client.id, "frame is not valid UTF-8");
            deliver(&client.channel, &ServerEvent::error("invalid message format (not UTF-8)"));
            continue;
        };
        let frame = frame.trim();
        if !frame.is_empty() {
            lobby.handle_frame(client, frame);
        }
    }
}
