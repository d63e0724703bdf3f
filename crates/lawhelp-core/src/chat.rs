//! Per-connection chat loop.
//!
//! Each accepted connection runs one [`ChatLoop::serve`] task:
//!
//! ```text
//! CONNECTING -> AWAITING_INPUT <-> PROCESSING -> CLOSED
//! ```
//!
//! Idle waits longer than the ping interval emit [`PING_MARKER`]; blank
//! messages get a re-prompt; every other message is one turn producing
//! exactly one reply. Backend failures degrade to fallback text, transport
//! failures close the connection.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    completion::{ChatMessage, CompletionBackend, CompletionRequest},
    config::Config,
    fallback::{LawFacts, FALLBACK_NOTICE, UNAVAILABLE_REPLY},
    jurisdiction,
    session::{Session, SessionId, SessionTable},
};

/// Out-of-band liveness payload. Clients must not render it.
pub const PING_MARKER: &str = "__PING__";

pub const REPROMPT: &str = "⚠️ I didn’t catch that. Could you please repeat?";

pub const DISCLAIMER: &str =
    "⚖️ This information is AI-generated for educational purposes and is not legal advice.";

pub const REFUSAL: &str = "I'm trained to discuss legal topics only.";

pub const REPLY_TEMPERATURE: f32 = 0.6;

/// One inbound event from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Peer closed the connection or the stream ended.
    Closed,
    /// The transport failed while reading.
    Failed(String),
}

/// A bidirectional text connection, as seen by the chat loop.
#[async_trait]
pub trait ChatTransport: Send {
    /// Next inbound event. Must be cancel-safe: the loop wraps it in a
    /// timeout and drops the future when the ping interval elapses.
    async fn recv(&mut self) -> Inbound;

    async fn send(&mut self, text: String) -> Result<()>;

    /// Close the connection if it is still open. Calling twice is harmless.
    async fn close(&mut self);

    /// Fired once the peer is known to be gone, from any task.
    fn disconnected(&self) -> CancellationToken;
}

/// Tunables and fixed texts for the chat loop.
#[derive(Debug, Clone)]
pub struct ChatPolicy {
    pub system_prompt: String,
    pub ping_interval: Duration,
    pub completion_timeout: Duration,
    pub reply_temperature: f32,
}

impl ChatPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.chat_system_prompt(),
            ping_interval: Duration::from_secs(config.ping_interval_s),
            completion_timeout: Duration::from_secs(config.completion_timeout_s),
            reply_temperature: REPLY_TEMPERATURE,
        }
    }
}

impl Default for ChatPolicy {
    fn default() -> Self {
        Self {
            system_prompt: system_prompt_for("LawHelpZone"),
            ping_interval: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(45),
            reply_temperature: REPLY_TEMPERATURE,
        }
    }
}

/// The fixed policy seeded as each session's first history entry.
pub fn system_prompt_for(assistant_name: &str) -> String {
    format!(
        "You are {assistant_name} AI, a professional yet friendly legal assistant. \
         You specialize in explaining laws, regulations, rights, and compliance across jurisdictions. \
         If the user greets you, warmly introduce yourself as {assistant_name}. \
         If a question is unrelated to law, reply: '{REFUSAL}' \
         Always end your response with: '{DISCLAIMER}'"
    )
}

/// Append the disclaimer to substantive replies that lack it. A reply that
/// opens with the refusal sentence is left as it is.
pub fn ensure_disclaimer(reply: &str) -> String {
    let reply = reply.trim();
    if reply.contains(DISCLAIMER) || reply.starts_with(REFUSAL) {
        reply.to_string()
    } else {
        format!("{reply}\n\n{DISCLAIMER}")
    }
}

enum Call {
    Done(Result<String>),
    Disconnected,
}

pub struct ChatLoop {
    sessions: SessionTable,
    backend: Arc<dyn CompletionBackend>,
    facts: Arc<LawFacts>,
    policy: ChatPolicy,
}

impl ChatLoop {
    pub fn new(
        sessions: SessionTable,
        backend: Arc<dyn CompletionBackend>,
        facts: Arc<LawFacts>,
        policy: ChatPolicy,
    ) -> Self {
        Self { sessions, backend, facts, policy }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// CONNECTING: create and register a fresh session.
    pub async fn open(&self) -> SessionId {
        let id = SessionId::next();
        self.sessions
            .insert(Session::new(id, self.policy.system_prompt.clone()))
            .await;
        info!(session = %id, "chat session opened");
        id
    }

    /// Open a session and serve it until the connection closes.
    pub async fn run<T: ChatTransport>(&self, transport: T) -> SessionId {
        let id = self.open().await;
        self.serve(id, transport).await;
        id
    }

    /// Drive an opened session to CLOSED. The session is always removed from
    /// the table on return.
    pub async fn serve<T: ChatTransport>(&self, id: SessionId, mut transport: T) {
        let disconnected = transport.disconnected();
        let outcome = self.converse(id, &mut transport, &disconnected).await;

        if let Err(e) = outcome {
            warn!(session = %id, "chat session failed: {e:#}");
            if !disconnected.is_cancelled() {
                let _ = transport.send(format!("Error: {e}")).await;
            }
        }

        self.close(id).await;
        transport.close().await;
    }

    /// CLOSED: drop the session. Safe to call more than once.
    pub async fn close(&self, id: SessionId) {
        if self.sessions.remove(id).await {
            info!(session = %id, "chat session closed");
        }
    }

    async fn converse<T: ChatTransport>(
        &self,
        id: SessionId,
        transport: &mut T,
        disconnected: &CancellationToken,
    ) -> Result<()> {
        loop {
            // AWAITING_INPUT
            let inbound = tokio::select! {
                _ = disconnected.cancelled() => return Ok(()),
                r = tokio::time::timeout(self.policy.ping_interval, transport.recv()) => r,
            };
            let inbound = match inbound {
                Ok(inbound) => inbound,
                Err(_) => {
                    debug!(session = %id, "idle, sending ping");
                    transport.send(PING_MARKER.to_string()).await?;
                    continue;
                }
            };

            let text = match inbound {
                Inbound::Text(text) => text,
                Inbound::Closed => {
                    debug!(session = %id, "peer disconnected");
                    return Ok(());
                }
                Inbound::Failed(e) => bail!("receive failed: {e}"),
            };

            let question = text.trim();
            if question.is_empty() {
                transport.send(REPROMPT.to_string()).await?;
                continue;
            }

            // PROCESSING
            match self.take_turn(id, question, disconnected).await {
                Some(payload) => transport.send(payload).await?,
                None => return Ok(()),
            }
        }
    }

    /// Run one turn. Returns the outbound payload, or `None` when the
    /// connection went away mid-turn and the result must be discarded.
    async fn take_turn(
        &self,
        id: SessionId,
        question: &str,
        disconnected: &CancellationToken,
    ) -> Option<String> {
        let previous = self.sessions.last_jurisdiction(id).await?;

        let request = jurisdiction::classification_request(question, &previous);
        let jurisdiction = match self.call(request, disconnected).await {
            Call::Done(Ok(answer)) => jurisdiction::resolve(&answer, &previous),
            Call::Done(Err(e)) => {
                debug!(session = %id, "classification failed, keeping {previous}: {e:#}");
                previous
            }
            Call::Disconnected => return None,
        };

        let user_entry = ChatMessage::user(jurisdiction::contextualize(question, &jurisdiction));
        let history = self.sessions.begin_turn(id, &jurisdiction, user_entry).await?;

        let request = CompletionRequest::new(history, self.policy.reply_temperature);
        let reply = match self.call(request, disconnected).await {
            Call::Done(Ok(text)) if !text.trim().is_empty() => ensure_disclaimer(&text),
            Call::Done(Ok(_)) => {
                warn!(session = %id, "backend returned an empty reply, using fallback");
                self.fallback_reply(&jurisdiction)
            }
            Call::Done(Err(e)) => {
                warn!(session = %id, jurisdiction = %jurisdiction, "reply failed, using fallback: {e:#}");
                self.fallback_reply(&jurisdiction)
            }
            Call::Disconnected => return None,
        };

        if !self.sessions.finish_turn(id, &reply).await {
            return None;
        }
        debug!(session = %id, jurisdiction = %jurisdiction, reply_len = reply.len(), "turn complete");
        Some(jurisdiction::encode_reply(&jurisdiction, &reply))
    }

    async fn call(&self, request: CompletionRequest, disconnected: &CancellationToken) -> Call {
        let timeout = self.policy.completion_timeout;
        tokio::select! {
            _ = disconnected.cancelled() => Call::Disconnected,
            r = tokio::time::timeout(timeout, self.backend.complete(request)) => match r {
                Ok(result) => Call::Done(result),
                Err(_) => Call::Done(Err(anyhow!("completion timed out after {}s", timeout.as_secs()))),
            },
        }
    }

    fn fallback_reply(&self, jurisdiction: &str) -> String {
        match self.facts.general(jurisdiction) {
            Some(text) => ensure_disclaimer(&format!("{FALLBACK_NOTICE}\n\n{text}")),
            None => UNAVAILABLE_REPLY.to_string(),
        }
    }
}
