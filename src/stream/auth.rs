//! Per-connection authentication handshake.
//!
//! The handshake first asks the token provider for a credential. Without one
//! the connection proceeds straight to resync; with one, an `auth` frame is
//! sent and resync waits for the correlated reply.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use secrecy::SecretString;
use tokio::sync::oneshot;

use crate::retry::with_timeout;
use crate::stream::client::PushClientError;
use crate::stream::proto::Envelope;

/// Async source of access tokens, consulted once per successful connection.
pub type TokenProvider = Arc<dyn Fn() -> BoxFuture<'static, Option<SecretString>> + Send + Sync>;

/// Wraps an async closure as a [`TokenProvider`].
pub fn token_provider<F, Fut>(provider: F) -> TokenProvider
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<SecretString>> + Send + 'static,
{
    Arc::new(move || provider().boxed())
}

/// Outcome of one handshake step.
pub enum AuthStep {
    /// The provider resolved.
    Credential(Option<SecretString>),
    /// The server answered the auth frame.
    Accepted(Envelope),
    /// The reply never arrived.
    Failed(PushClientError),
}

enum AuthPhase {
    FetchingCredential(BoxFuture<'static, Option<SecretString>>),
    AwaitingReply(BoxFuture<'static, Result<Envelope, PushClientError>>),
    Done,
}

pub struct AuthHandshake {
    phase: AuthPhase,
}

impl AuthHandshake {
    pub fn start(provider: Option<&TokenProvider>) -> Self {
        let credential = match provider {
            Some(provider) => provider(),
            None => futures_util::future::ready(None).boxed(),
        };
        Self {
            phase: AuthPhase::FetchingCredential(credential),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, AuthPhase::Done)
    }

    /// Waits for the reply delivered through `reply`, bounded by `timeout`
    /// when set.
    pub fn await_reply(&mut self, reply: oneshot::Receiver<Envelope>, timeout: Option<Duration>) {
        let wait = match timeout {
            Some(limit) => async move {
                match with_timeout(limit, reply).await {
                    Ok(Ok(envelope)) => Ok(envelope),
                    Ok(Err(_)) => Err(PushClientError::TransportClosed),
                    Err(_) => Err(PushClientError::AuthTimeout(limit)),
                }
            }
            .boxed(),
            None => async move { reply.await.map_err(|_| PushClientError::TransportClosed) }.boxed(),
        };
        self.phase = AuthPhase::AwaitingReply(wait);
    }

    /// Resolves with the next step, or never once the handshake is done.
    ///
    /// Cancel safe: the in-flight future stays in place if this is dropped.
    pub async fn next_step(&mut self) -> AuthStep {
        let step = match &mut self.phase {
            AuthPhase::FetchingCredential(credential) => AuthStep::Credential(credential.await),
            AuthPhase::AwaitingReply(reply) => match reply.await {
                Ok(envelope) => AuthStep::Accepted(envelope),
                Err(err) => AuthStep::Failed(err),
            },
            AuthPhase::Done => return std::future::pending().await,
        };
        self.phase = AuthPhase::Done;
        step
    }
}
