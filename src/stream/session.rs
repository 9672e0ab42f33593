//! Per-connection session state.
//!
//! A `Session` exists exactly as long as one transport link. It owns the
//! link, the correlation-id generator, the dispatcher's pending replies, the
//! auth handshake and the liveness timer, so dropping it tears all of them
//! down together.

use std::time::Duration;

use secrecy::SecretString;
use tokio::time::Instant;

use crate::stream::auth::{AuthHandshake, AuthStep, TokenProvider};
use crate::stream::client::PushClientError;
use crate::stream::dispatch::Dispatcher;
use crate::stream::liveness::LivenessMonitor;
use crate::stream::proto::{ClientFrame, Envelope};
use crate::stream::transport::{TransportEvent, TransportLink};

pub(crate) enum SessionEvent {
    Transport(TransportEvent),
    Auth(AuthStep),
    LivenessTick,
}

pub(crate) struct Session {
    link: TransportLink,
    id_prefix: u32,
    next_id: u64,
    dispatcher: Dispatcher,
    auth: AuthHandshake,
    liveness: LivenessMonitor,
}

impl Session {
    pub(crate) fn start(
        link: TransportLink,
        now: Instant,
        ping_interval: Duration,
        stall_threshold: Duration,
        token_provider: Option<&TokenProvider>,
    ) -> Self {
        Self {
            link,
            id_prefix: rand::random(),
            next_id: 0,
            dispatcher: Dispatcher::default(),
            auth: AuthHandshake::start(token_provider),
            liveness: LivenessMonitor::start(now, ping_interval, stall_threshold),
        }
    }

    fn next_correlation_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}-{}", self.id_prefix, self.next_id)
    }

    /// Stamps `frame` with a fresh correlation id and sends it. Returns the id.
    pub(crate) fn send(&mut self, frame: ClientFrame) -> Result<String, PushClientError> {
        let id = self.next_correlation_id();
        let text = frame.into_envelope(id.clone())?.to_text()?;
        self.link.send(text)?;
        Ok(id)
    }

    /// Sends the auth frame and arms the correlated reply wait.
    pub(crate) fn authenticate(
        &mut self,
        credential: SecretString,
        timeout: Option<Duration>,
    ) -> Result<(), PushClientError> {
        let id = self.send(ClientFrame::Auth { credential })?;
        let reply = self.dispatcher.expect_reply(id);
        self.auth.await_reply(reply, timeout);
        Ok(())
    }

    pub(crate) fn handle_frame(
        &mut self,
        text: &str,
        last_seen_id: &mut Option<String>,
        now: Instant,
    ) -> Result<Option<Envelope>, PushClientError> {
        self.liveness.record_activity(now);
        self.dispatcher.dispatch(text, last_seen_id)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub(crate) fn is_stalled(&self, now: Instant) -> bool {
        self.liveness.is_stalled(now)
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        self.liveness.idle_for(now)
    }

    pub(crate) async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            event = self.link.next_event() => SessionEvent::Transport(event),
            step = self.auth.next_step() => SessionEvent::Auth(step),
            _ = self.liveness.tick() => SessionEvent::LivenessTick,
        }
    }

    pub(crate) fn close(self) {
        self.link.close();
    }
}
