//! Inbound frame handling.
//!
//! The dispatcher decodes frames, resolves correlated replies that a caller
//! is waiting on, keeps the last-seen message id current, and decides which
//! envelopes reach the application.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::stream::client::PushClientError;
use crate::stream::proto::{Envelope, FrameKind};

#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: HashMap<String, oneshot::Sender<Envelope>>,
}

impl Dispatcher {
    /// Registers a one-shot slot completed by the first inbound frame whose
    /// id equals `id`.
    pub fn expect_reply(&mut self, id: String) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        rx
    }

    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Handles one inbound text frame.
    ///
    /// Returns the envelope to emit, or `None` for frames that stay internal.
    pub fn dispatch(
        &mut self,
        text: &str,
        last_seen_id: &mut Option<String>,
    ) -> Result<Option<Envelope>, PushClientError> {
        let envelope = Envelope::from_text(text)?;

        if let Some(slot) = self.pending.remove(&envelope.id) {
            debug!(event = "push_reply_matched", id = %envelope.id, kind = %envelope.kind);
            let _ = slot.send(envelope.clone());
        }

        if envelope.carries_application_data() {
            *last_seen_id = Some(envelope.id.clone());
        }

        if envelope.frame_kind() == FrameKind::Ack {
            return Ok(None);
        }
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use crate::stream::client::PushClientError;

    #[test]
    fn application_frames_are_emitted_and_tracked() {
        let mut dispatcher = Dispatcher::default();
        let mut last_seen = None;

        let emitted = dispatcher
            .dispatch(r#"{"i":"m-1","t":"comment","c":"repo:team:1","p":{"x":1}}"#, &mut last_seen)
            .expect("dispatch")
            .expect("emitted");
        assert_eq!(emitted.kind, "comment");
        assert_eq!(last_seen.as_deref(), Some("m-1"));
    }

    #[test]
    fn ack_is_suppressed_and_does_not_move_last_seen() {
        let mut dispatcher = Dispatcher::default();
        let mut last_seen = Some("m-1".to_string());

        let emitted = dispatcher
            .dispatch(r#"{"i":"c-9","t":"ack"}"#, &mut last_seen)
            .expect("dispatch");
        assert!(emitted.is_none());
        assert_eq!(last_seen.as_deref(), Some("m-1"));
    }

    #[test]
    fn error_is_emitted_without_moving_last_seen() {
        let mut dispatcher = Dispatcher::default();
        let mut last_seen = Some("m-1".to_string());

        let emitted = dispatcher
            .dispatch(r#"{"i":"c-3","t":"error","p":"bad channel"}"#, &mut last_seen)
            .expect("dispatch")
            .expect("emitted");
        assert_eq!(emitted.kind, "error");
        assert_eq!(last_seen.as_deref(), Some("m-1"));
    }

    #[test]
    fn malformed_frames_surface_as_decode_errors() {
        let mut dispatcher = Dispatcher::default();
        let mut last_seen = None;
        let err = dispatcher
            .dispatch("not-json", &mut last_seen)
            .expect_err("decode error");
        assert!(matches!(err, PushClientError::Json(_)));
        assert!(last_seen.is_none());
    }

    #[test]
    fn correlated_reply_completes_once() {
        let mut dispatcher = Dispatcher::default();
        let mut last_seen = None;
        let mut reply = dispatcher.expect_reply("auth-1".to_string());
        assert_eq!(dispatcher.pending_replies(), 1);

        dispatcher
            .dispatch(r#"{"i":"other","t":"ack"}"#, &mut last_seen)
            .expect("dispatch");
        assert!(reply.try_recv().is_err());

        dispatcher
            .dispatch(r#"{"i":"auth-1","t":"ack"}"#, &mut last_seen)
            .expect("dispatch");
        let matched = reply.try_recv().expect("reply delivered");
        assert_eq!(matched.id, "auth-1");
        assert_eq!(dispatcher.pending_replies(), 0);
    }
}
