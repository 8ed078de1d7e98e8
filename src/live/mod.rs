//! Live updates for connected browser sessions.
//!
//! The [`Broadcaster`] owns the set of sessions and the last message sent for
//! every asset class. Sessions go through `Connecting -> Active -> Closed`:
//! while connecting a session is caught up with the latest message of every
//! class, after that it receives every new message as it is broadcast. A
//! session whose connection fails is closed and dropped without affecting the
//! others.
//!
//! Messages for one class only ever move forward: a message whose generation
//! is not newer than the last one broadcast for its class is discarded, so a
//! slow build finishing after a faster, newer one can never roll a session
//! back.

#[cfg(feature = "live")]
pub(crate) mod ws;

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::AssetClass;

/// How a session should apply an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    ReloadFull,
    /// Stylesheets only.
    SwapInPlace,
}

/// The wire message: `{"assetClass":"style","generation":3,"mode":"swap-in-place"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub asset_class: AssetClass,
    pub generation: u64,
    pub mode: UpdateMode,
}

impl UpdateMessage {
    /// Scripts always reload; stylesheets are swapped unless the previous
    /// build of the class failed, in which case the page is reloaded too.
    pub fn for_artifact(class: AssetClass, generation: u64, recovered: bool) -> Self {
        let mode = match class {
            AssetClass::Style if !recovered => UpdateMode::SwapInPlace,
            _ => UpdateMode::ReloadFull,
        };

        Self {
            asset_class: class,
            generation,
            mode,
        }
    }

    pub fn to_json(&self) -> String {
        // plain struct of enums and integers, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The sending half of one browser connection.
///
/// Sinks are called with the broadcaster's lock held and must hand the frame
/// off without waiting on the network.
pub trait SessionSink: Send {
    /// Queues one text frame. An error means the connection is dead.
    fn send(&mut self, text: &str) -> anyhow::Result<()>;

    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Identifies a session for [`Broadcaster::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

struct Session {
    id: SessionId,
    state: SessionState,
    sink: Box<dyn SessionSink>,
}

impl Session {
    fn deliver(&mut self, message: &UpdateMessage) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.sink.send(&message.to_json()) {
            tracing::debug!(session = self.id.0, "dropping session: {e}");
            self.state = SessionState::Closed;
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: Vec<Session>,
    latest: BTreeMap<AssetClass, UpdateMessage>,
    next_id: u64,
}

#[derive(Default)]
pub struct Broadcaster {
    inner: Mutex<Inner>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session and catches it up with the latest message per class.
    pub fn connect(&self, sink: Box<dyn SessionSink>) -> SessionId {
        let mut inner = self.inner.lock().unwrap();

        let id = SessionId(inner.next_id);
        inner.next_id += 1;

        let mut session = Session {
            id,
            state: SessionState::Connecting,
            sink,
        };

        for message in inner.latest.values() {
            session.deliver(message);
        }

        if session.state == SessionState::Closed {
            tracing::debug!(session = id.0, "session closed during catch-up");
            return id;
        }

        session.state = SessionState::Active;
        inner.sessions.push(session);
        tracing::info!(session = id.0, sessions = inner.sessions.len(), "browser connected");

        id
    }

    pub fn disconnect(&self, id: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.sessions.iter().position(|s| s.id == id) {
            let mut session = inner.sessions.remove(index);
            session.state = SessionState::Closed;
            session.sink.close();
        }
    }

    /// Sends `message` to every active session.
    ///
    /// Returns the number of sessions it reached, `0` for a stale message.
    pub fn broadcast(&self, message: UpdateMessage) -> usize {
        let mut inner = self.inner.lock().unwrap();

        if let Some(latest) = inner.latest.get(&message.asset_class)
            && latest.generation >= message.generation
        {
            tracing::debug!(
                class = %message.asset_class,
                generation = message.generation,
                latest = latest.generation,
                "not broadcasting stale generation"
            );
            return 0;
        }

        inner.latest.insert(message.asset_class, message);

        for session in &mut inner.sessions {
            session.deliver(&message);
        }
        inner
            .sessions
            .retain(|session| session.state != SessionState::Closed);

        let reached = inner.sessions.len();
        tracing::debug!(
            class = %message.asset_class,
            generation = message.generation,
            sessions = reached,
            "broadcast"
        );

        reached
    }

    /// Active sessions.
    pub fn sessions(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn latest(&self, class: AssetClass) -> Option<UpdateMessage> {
        self.inner.lock().unwrap().latest.get(&class).copied()
    }

    /// Script for harness pages, connecting to the live socket on `port`.
    ///
    /// The last generation seen per class is kept in `sessionStorage`, so the
    /// catch-up message after a reload or reconnect is only acted upon when
    /// something was actually rebuilt in between. Anything it does not
    /// understand is ignored.
    pub fn client_script(port: u16) -> String {
        format!(
            r#"
(function () {{
    var key = "livepack:";
    function swap() {{
        document.querySelectorAll('link[rel="stylesheet"]').forEach(function (link) {{
            var url = new URL(link.href);
            url.searchParams.set("livepack", Date.now());
            link.href = url.toString();
        }});
    }}
    function connect() {{
        var socket = new WebSocket("ws://" + location.hostname + ":{port}");
        socket.addEventListener("message", function (event) {{
            var msg;
            try {{ msg = JSON.parse(event.data); }} catch (e) {{ return; }}
            if (!msg || typeof msg.generation !== "number") return;
            if (msg.assetClass !== "script" && msg.assetClass !== "style") return;
            var seen = sessionStorage.getItem(key + msg.assetClass);
            sessionStorage.setItem(key + msg.assetClass, msg.generation);
            if (seen === null || Number(seen) >= msg.generation) return;
            if (msg.mode === "swap-in-place") swap();
            else if (msg.mode === "reload-full") location.reload();
        }});
        socket.addEventListener("close", function () {{ setTimeout(connect, 1000); }});
    }}
    connect();
}})();
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// In-memory session recording what it was sent.
    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<UpdateMessage>>>,
        dead: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn messages(&self) -> Vec<UpdateMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn kill(&self) {
            *self.dead.lock().unwrap() = true;
        }
    }

    impl SessionSink for Recorder {
        fn send(&mut self, text: &str) -> anyhow::Result<()> {
            if *self.dead.lock().unwrap() {
                anyhow::bail!("broken pipe");
            }
            self.sent.lock().unwrap().push(serde_json::from_str(text)?);
            Ok(())
        }
    }

    fn script(generation: u64) -> UpdateMessage {
        UpdateMessage::for_artifact(AssetClass::Script, generation, false)
    }

    fn style(generation: u64) -> UpdateMessage {
        UpdateMessage::for_artifact(AssetClass::Style, generation, false)
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            style(3).to_json(),
            r#"{"assetClass":"style","generation":3,"mode":"swap-in-place"}"#
        );
        assert_eq!(
            script(1).to_json(),
            r#"{"assetClass":"script","generation":1,"mode":"reload-full"}"#
        );
        assert_eq!(
            UpdateMessage::for_artifact(AssetClass::Style, 4, true).mode,
            UpdateMode::ReloadFull
        );
    }

    #[test]
    fn late_session_is_caught_up_with_latest_generation() {
        let broadcaster = Broadcaster::new();
        for generation in 1..=3 {
            broadcaster.broadcast(script(generation));
        }
        broadcaster.broadcast(style(1));

        let late = Recorder::default();
        broadcaster.connect(Box::new(late.clone()));

        assert_eq!(late.messages(), vec![script(3), style(1)]);
        assert_eq!(broadcaster.sessions(), 1);
    }

    #[test]
    fn nothing_to_catch_up_before_first_build() {
        let broadcaster = Broadcaster::new();
        let session = Recorder::default();

        broadcaster.connect(Box::new(session.clone()));

        assert!(session.messages().is_empty());
    }

    #[test]
    fn stale_generation_is_not_broadcast() {
        let broadcaster = Broadcaster::new();
        let session = Recorder::default();
        broadcaster.connect(Box::new(session.clone()));

        assert_eq!(broadcaster.broadcast(script(2)), 1);
        assert_eq!(broadcaster.broadcast(script(1)), 0);
        assert_eq!(broadcaster.broadcast(script(2)), 0);
        assert_eq!(broadcaster.broadcast(style(1)), 1);

        assert_eq!(session.messages(), vec![script(2), style(1)]);
        assert_eq!(broadcaster.latest(AssetClass::Script), Some(script(2)));
    }

    #[test]
    fn dead_session_is_dropped_silently() {
        let broadcaster = Broadcaster::new();
        let alive = Recorder::default();
        let dead = Recorder::default();
        broadcaster.connect(Box::new(alive.clone()));
        broadcaster.connect(Box::new(dead.clone()));

        dead.kill();
        let reached = broadcaster.broadcast(style(1));

        assert_eq!(reached, 1);
        assert_eq!(broadcaster.sessions(), 1);
        assert_eq!(alive.messages(), vec![style(1)]);
        assert!(dead.messages().is_empty());
    }

    #[test]
    fn broadcasting_to_nobody_is_fine() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.broadcast(script(1)), 0);
        assert_eq!(broadcaster.latest(AssetClass::Script), Some(script(1)));
    }

    #[test]
    fn reconnect_receives_newer_generation() {
        let broadcaster = Broadcaster::new();
        broadcaster.broadcast(script(1));

        let first = Recorder::default();
        let id = broadcaster.connect(Box::new(first.clone()));
        broadcaster.disconnect(id);
        assert_eq!(broadcaster.sessions(), 0);

        broadcaster.broadcast(script(2));

        let again = Recorder::default();
        broadcaster.connect(Box::new(again.clone()));

        assert_eq!(first.messages(), vec![script(1)]);
        assert_eq!(again.messages(), vec![script(2)]);
    }

    #[test]
    fn client_script_targets_port() {
        let script = Broadcaster::client_script(1337);
        assert!(script.contains(r#"":1337""#));
        assert!(script.contains("swap-in-place"));
    }
}
