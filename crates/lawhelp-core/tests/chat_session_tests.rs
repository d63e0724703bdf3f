use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lawhelp_core::{
    chat::{ChatLoop, ChatPolicy, ChatTransport, Inbound, PING_MARKER, REPROMPT},
    completion::{ChatMessage, CompletionBackend, CompletionRequest, Role},
    fallback::{LawFacts, UNAVAILABLE_REPLY},
    session::{SessionId, SessionTable, DEFAULT_JURISDICTION},
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

// ── Test doubles ──────────────────────────────────────────────────────────

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
    token: CancellationToken,
    fail_sends: bool,
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn recv(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Closed)
    }

    async fn send(&mut self, text: String) -> Result<()> {
        if self.fail_sends {
            bail!("broken pipe");
        }
        self.outbound.send(text).map_err(|_| anyhow!("peer gone"))
    }

    async fn close(&mut self) {
        self.inbound.close();
    }

    fn disconnected(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// The client side of a mock connection.
struct Peer {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
}

impl Peer {
    fn say(&self, text: &str) {
        self.tx.send(Inbound::Text(text.to_string())).unwrap();
    }

    async fn ask(&mut self, text: &str) -> String {
        self.say(text);
        self.next().await
    }

    async fn next(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("no outbound message")
            .expect("connection closed")
    }
}

type ClassifyFn = dyn Fn(&str) -> Result<String> + Send + Sync;
type ReplyFn = dyn Fn(&[ChatMessage]) -> Result<String> + Send + Sync;

/// Routes classification calls (one system turn) and reply calls (full
/// history) to separate scripts.
struct ScriptedBackend {
    classify: Box<ClassifyFn>,
    reply: Box<ReplyFn>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    fn new(
        classify: impl Fn(&str) -> Result<String> + Send + Sync + 'static,
        reply: impl Fn(&[ChatMessage]) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            classify: Box::new(classify),
            reply: Box::new(reply),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let is_classification =
            request.messages.len() == 1 && request.messages[0].role == Role::System;
        if is_classification {
            (self.classify)(&request.messages[0].text)
        } else {
            (self.reply)(&request.messages)
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Echoes the question found in the last user entry.
fn echo_reply(history: &[ChatMessage]) -> Result<String> {
    let last = history.last().map(|m| m.text.as_str()).unwrap_or_default();
    let question = last.rsplit("User question: ").next().unwrap_or_default();
    Ok(format!("Answer: {question}"))
}

fn chat_with(backend: impl CompletionBackend + 'static) -> Arc<ChatLoop> {
    chat_with_facts(backend, LawFacts::empty())
}

fn chat_with_facts(backend: impl CompletionBackend + 'static, facts: LawFacts) -> Arc<ChatLoop> {
    Arc::new(ChatLoop::new(
        SessionTable::new(),
        Arc::new(backend),
        Arc::new(facts),
        ChatPolicy::default(),
    ))
}

fn transport(fail_sends: bool) -> (MockTransport, Peer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    (
        MockTransport {
            inbound: in_rx,
            outbound: out_tx,
            token: token.clone(),
            fail_sends,
        },
        Peer { tx: in_tx, rx: out_rx, token },
    )
}

async fn connect(chat: &Arc<ChatLoop>) -> (SessionId, Peer, JoinHandle<()>) {
    let (transport, peer) = transport(false);
    let id = chat.open().await;
    let chat = Arc::clone(chat);
    let handle = tokio::spawn(async move { chat.serve(id, transport).await });
    (id, peer, handle)
}

async fn history_len(chat: &ChatLoop, id: SessionId) -> usize {
    chat.sessions()
        .get(id)
        .await
        .map(|s| s.history().len())
        .unwrap_or(0)
}

// ── Turns ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_compete_question_tagged_usa() {
    let chat = chat_with(ScriptedBackend::new(
        |_| Ok("USA".into()),
        |_| Ok("A non-compete clause is...".into()),
    ));
    let (id, mut peer, _handle) = connect(&chat).await;

    let payload = peer.ask("What is a non-compete clause?").await;
    assert!(payload.starts_with("__JURISDICTION__:USA\n"));
    assert!(payload.contains("A non-compete clause is..."));

    let session = chat.sessions().get(id).await.unwrap();
    let roles: Vec<Role> = session.history().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert!(session.history()[1].text.contains("What is a non-compete clause?"));
    assert_eq!(session.last_jurisdiction, "USA");
}

#[tokio::test]
async fn test_each_message_gets_one_reply_in_order() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("UK".into()), echo_reply));
    let (id, mut peer, _handle) = connect(&chat).await;

    let questions = ["What is bail?", "What is tort?", "What is equity?"];
    for q in questions {
        peer.say(q);
    }
    for (turn, q) in questions.iter().enumerate() {
        let payload = peer.next().await;
        assert_ne!(payload, PING_MARKER);
        assert!(payload.contains(&format!("Answer: {q}")), "turn {turn}: {payload}");
    }
    assert!(peer.rx.try_recv().is_err());
    assert_eq!(history_len(&chat, id).await, 1 + 2 * questions.len());
}

#[tokio::test]
async fn test_blank_input_reprompts_without_backend_call() {
    let backend = ScriptedBackend::new(|_| Ok("UK".into()), echo_reply);
    let calls = Arc::clone(&backend.calls);
    let chat = chat_with(backend);
    let (id, mut peer, _handle) = connect(&chat).await;

    assert_eq!(peer.ask("").await, REPROMPT);
    assert_eq!(peer.ask("   \n\t").await, REPROMPT);
    assert_eq!(history_len(&chat, id).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let payload = peer.ask("Is a verbal contract binding?").await;
    assert!(payload.contains("Answer: Is a verbal contract binding?"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_pinged_then_continues() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("India".into()), echo_reply));
    let (id, mut peer, _handle) = connect(&chat).await;

    assert_eq!(peer.rx.recv().await.unwrap(), PING_MARKER);
    assert_eq!(history_len(&chat, id).await, 1);

    let payload = peer.ask("What is an FIR?").await;
    assert!(payload.starts_with("__JURISDICTION__:India\n"));
    assert_eq!(history_len(&chat, id).await, 3);
}

// ── Jurisdiction ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_classification_failure_keeps_previous_jurisdiction() {
    let answers = Arc::new(std::sync::Mutex::new(vec![
        Err(anyhow!("rate limited")),
        Ok("Pakistan".to_string()),
        Ok("   ".to_string()),
        Err(anyhow!("timeout")),
    ]));
    let script = Arc::clone(&answers);
    let chat = chat_with(ScriptedBackend::new(
        move |_| script.lock().unwrap().remove(0),
        echo_reply,
    ));
    let (id, mut peer, _handle) = connect(&chat).await;

    let expected = [DEFAULT_JURISDICTION, "Pakistan", "Pakistan", "Pakistan"];
    for (turn, want) in expected.iter().enumerate() {
        let payload = peer.ask(&format!("question {turn}")).await;
        assert!(payload.starts_with(&format!("__JURISDICTION__:{want}\n")), "{payload}");
        let session = chat.sessions().get(id).await.unwrap();
        assert_eq!(session.last_jurisdiction, *want);
    }
}

#[tokio::test]
async fn test_classifier_prompt_offers_previous_jurisdiction() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let chat = chat_with(ScriptedBackend::new(
        move |prompt| {
            log.lock().unwrap().push(prompt.to_string());
            Ok("Canada".into())
        },
        echo_reply,
    ));
    let (_id, mut peer, _handle) = connect(&chat).await;

    peer.ask("Can my landlord evict me?").await;
    peer.ask("And with notice?").await;

    let prompts = seen.lock().unwrap();
    assert!(prompts[0].contains("If unclear, respond 'General'"));
    assert!(prompts[1].contains("If unclear, respond 'Canada'"));
}

// ── Failures ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reply_failure_degrades_to_fallback() {
    let chat = chat_with(ScriptedBackend::new(
        |_| Ok("Australia".into()),
        |_| Err(anyhow!("upstream 503")),
    ));
    let (id, mut peer, handle) = connect(&chat).await;

    let payload = peer.ask("What is negligence?").await;
    assert_eq!(payload, format!("__JURISDICTION__:Australia\n{UNAVAILABLE_REPLY}"));
    assert_eq!(history_len(&chat, id).await, 3);

    let again = peer.ask("And contributory negligence?").await;
    assert!(again.contains(UNAVAILABLE_REPLY));
    assert_eq!(history_len(&chat, id).await, 5);
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn test_reply_failure_uses_reference_text_when_known() {
    let facts = LawFacts::from_json(r#"{"UK":{"general":"UK law is largely common law."}}"#).unwrap();
    let chat = chat_with_facts(
        ScriptedBackend::new(|_| Ok("UK".into()), |_| Err(anyhow!("boom"))),
        facts,
    );
    let (_id, mut peer, _handle) = connect(&chat).await;

    let payload = peer.ask("What is consideration?").await;
    assert!(payload.starts_with("__JURISDICTION__:UK\n"));
    assert!(payload.contains("UK law is largely common law."));
}

#[tokio::test]
async fn test_empty_reply_degrades_to_fallback() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("EU".into()), |_| Ok("  ".into())));
    let (_id, mut peer, _handle) = connect(&chat).await;

    let payload = peer.ask("What is GDPR?").await;
    assert!(payload.ends_with(UNAVAILABLE_REPLY));
}

#[tokio::test]
async fn test_receive_failure_reports_error_and_cleans_up() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("UK".into()), echo_reply));
    let (id, mut peer, handle) = connect(&chat).await;

    peer.tx.send(Inbound::Failed("connection reset".into())).unwrap();
    let last = peer.next().await;
    assert!(last.starts_with("Error: "), "{last}");
    handle.await.unwrap();
    assert!(!chat.sessions().contains(id).await);
}

#[tokio::test]
async fn test_send_failure_closes_session() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("UK".into()), echo_reply));
    let (transport, peer) = transport(true);
    let id = chat.open().await;
    peer.say("What is a lien?");

    tokio::time::timeout(Duration::from_secs(5), chat.serve(id, transport))
        .await
        .unwrap();
    assert!(!chat.sessions().contains(id).await);
}

// ── Lifecycle ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sessions_are_isolated() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("USA".into()), echo_reply));
    let (a, mut peer_a, handle_a) = connect(&chat).await;
    let (b, mut peer_b, _handle_b) = connect(&chat).await;
    assert_ne!(a, b);

    peer_a.ask("What is habeas corpus?").await;
    assert_eq!(history_len(&chat, a).await, 3);
    assert_eq!(history_len(&chat, b).await, 1);

    peer_b.ask("What is a subpoena?").await;
    let session_a = chat.sessions().get(a).await.unwrap();
    assert!(session_a
        .history()
        .iter()
        .all(|m| !m.text.contains("subpoena")));

    drop(peer_a);
    handle_a.await.unwrap();
    assert!(!chat.sessions().contains(a).await);
    assert!(chat.sessions().contains(b).await);
    assert_eq!(history_len(&chat, b).await, 3);
}

#[tokio::test]
async fn test_disconnect_removes_session_and_close_is_idempotent() {
    let chat = chat_with(ScriptedBackend::new(|_| Ok("UK".into()), echo_reply));
    let (id, peer, handle) = connect(&chat).await;
    assert_eq!(chat.sessions().len().await, 1);

    peer.tx.send(Inbound::Closed).unwrap();
    handle.await.unwrap();
    assert!(!chat.sessions().contains(id).await);

    chat.close(id).await;
    chat.close(id).await;
    assert!(chat.sessions().is_empty().await);
}

/// Reply calls never finish; signals once one has started.
struct StallingBackend {
    started: Arc<Notify>,
}

#[async_trait]
impl CompletionBackend for StallingBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if request.messages.len() == 1 {
            return Ok("UK".into());
        }
        self.started.notify_one();
        std::future::pending().await
    }

    fn name(&self) -> &str {
        "stalling"
    }
}

#[tokio::test]
async fn test_disconnect_mid_turn_discards_reply() {
    let started = Arc::new(Notify::new());
    let chat = chat_with(StallingBackend { started: Arc::clone(&started) });
    let (id, mut peer, handle) = connect(&chat).await;

    peer.say("What is an injunction?");
    started.notified().await;
    peer.token.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!chat.sessions().contains(id).await);
    assert!(peer.rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_backend_times_out_to_fallback() {
    let chat = chat_with(StallingBackend { started: Arc::new(Notify::new()) });
    let (id, mut peer, _handle) = connect(&chat).await;

    let payload = peer.rx_after("What is an injunction?").await;
    assert_eq!(payload, format!("__JURISDICTION__:UK\n{UNAVAILABLE_REPLY}"));
    assert_eq!(history_len(&chat, id).await, 3);
}

impl Peer {
    /// Like `ask`, but without a wall-clock guard so paused time can advance
    /// through backend timeouts.
    async fn rx_after(&mut self, text: &str) -> String {
        self.say(text);
        loop {
            let msg = self.rx.recv().await.expect("connection closed");
            if msg != PING_MARKER {
                return msg;
            }
        }
    }
}
