//! WebSocket transport for the [`Broadcaster`].
//!
//! One thread accepts connections and hands each of them to a thread of its
//! own for the handshake. Every established socket then gets a writer thread
//! fed through a channel, so broadcasting never touches the network and a
//! browser that stops reading only ever stalls its own writer, which gives up
//! after [`WRITE_TIMEOUT`].

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tungstenite::Message;

use super::{Broadcaster, SessionSink};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Socket(Sender<String>);

impl SessionSink for Socket {
    fn send(&mut self, text: &str) -> anyhow::Result<()> {
        self.0
            .send(text.to_string())
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}

/// Completes the handshake and starts the writer thread.
fn open(stream: TcpStream) -> anyhow::Result<Socket> {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let mut socket =
        tungstenite::accept(stream).map_err(|e| anyhow::anyhow!("handshake failed: {e}"))?;
    socket.get_ref().set_read_timeout(None)?;

    let (sender, receiver) = channel::<String>();
    thread::spawn(move || {
        for text in receiver {
            if let Err(e) = socket.send(Message::text(text)) {
                tracing::debug!("live socket write failed: {e}");
                return;
            }
        }
        // every sender is gone, the session was dropped
        socket.close(None).ok();
        socket.flush().ok();
    });

    Ok(Socket(sender))
}

/// Binds the live socket, preferring `preferred` and falling back to any
/// free port.
pub(crate) fn reserve_port(preferred: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind(("127.0.0.1", preferred)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

pub(crate) fn spawn_listener(
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("live socket: {e}");
                    continue;
                }
            };

            let broadcaster = broadcaster.clone();
            thread::spawn(move || match open(stream) {
                Ok(socket) => {
                    broadcaster.connect(Box::new(socket));
                }
                Err(e) => tracing::warn!("live socket: {e}"),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Instant;

    use super::*;
    use crate::core::AssetClass;
    use crate::live::UpdateMessage;

    #[test]
    fn connected_client_gets_catch_up_and_updates() {
        let broadcaster = Arc::new(Broadcaster::new());
        broadcaster.broadcast(UpdateMessage::for_artifact(AssetClass::Script, 1, false));

        let (listener, port) = reserve_port(0).unwrap();
        let _thread = spawn_listener(listener, broadcaster.clone());

        let (mut client, _) = tungstenite::connect(format!("ws://127.0.0.1:{port}")).unwrap();

        let catch_up = client.read().unwrap();
        assert_eq!(
            catch_up.into_text().unwrap().as_str(),
            r#"{"assetClass":"script","generation":1,"mode":"reload-full"}"#
        );

        // the session is registered right after the catch-up is queued
        wait_for_sessions(&broadcaster, 1);

        broadcaster.broadcast(UpdateMessage::for_artifact(AssetClass::Style, 1, false));
        let update = client.read().unwrap();
        assert_eq!(
            update.into_text().unwrap().as_str(),
            r#"{"assetClass":"style","generation":1,"mode":"swap-in-place"}"#
        );
    }

    fn wait_for_sessions(broadcaster: &Broadcaster, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while broadcaster.sessions() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn silent_client_does_not_block_others() {
        let broadcaster = Arc::new(Broadcaster::new());
        broadcaster.broadcast(UpdateMessage::for_artifact(AssetClass::Style, 1, false));

        let (listener, port) = reserve_port(0).unwrap();
        let _thread = spawn_listener(listener, broadcaster.clone());

        // connects and never completes the handshake
        let mut silent = TcpStream::connect(("127.0.0.1", port)).unwrap();
        silent.write_all(b"GET / HTTP/1.1\r\n").unwrap();

        let (mut client, _) = tungstenite::connect(format!("ws://127.0.0.1:{port}")).unwrap();
        let catch_up = client.read().unwrap();
        assert!(catch_up.into_text().unwrap().contains(r#""generation":1"#));
    }

    #[test]
    fn client_that_stops_reading_does_not_stall_broadcasts() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (listener, port) = reserve_port(0).unwrap();
        let _thread = spawn_listener(listener, broadcaster.clone());

        // never reads a single frame
        let (_stalled, _) = tungstenite::connect(format!("ws://127.0.0.1:{port}")).unwrap();
        wait_for_sessions(&broadcaster, 1);

        let start = Instant::now();
        for generation in 1..=50_000 {
            broadcaster.broadcast(UpdateMessage::for_artifact(AssetClass::Script, generation, false));
        }

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(
            broadcaster.latest(AssetClass::Script).unwrap().generation,
            50_000
        );
    }
}
