use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

/// Entries kept for `/api/logs/recent` and replayed to new SSE subscribers.
pub(crate) const LOG_RING_CAPACITY: usize = 500;

pub(crate) type LogRing = Arc<std::sync::Mutex<VecDeque<String>>>;

/// Mirrors tracing events as JSON lines into a ring buffer and a broadcast
/// channel for the log stream endpoints.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: LogRing,
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            use std::fmt::Write;
            let _ = write!(self.message, "{value:?}");
            // Strip surrounding quotes added by Debug on &str
            if self.message.starts_with('"') && self.message.ends_with('"') && self.message.len() >= 2 {
                *self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }
}

/// Dashboard grouping for an event target.
pub(crate) fn category(target: &str) -> &'static str {
    const CHAT: &[&str] = &["chat", "session", "jurisdiction", "fallback", "ws", "lawhelp_llm"];
    const DOCUMENTS: &[&str] = &["documents", "db", "storage", "pdf", "extract", "drafting", "signing"];

    let module = target.rsplit("::").next().unwrap_or(target);
    if CHAT.iter().any(|c| module == *c || target.starts_with(c)) {
        "chat"
    } else if DOCUMENTS.contains(&module) {
        "documents"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let target = event.metadata().target();

        let mut message = String::new();
        event.record(&mut MessageVisitor {
            message: &mut message,
        });

        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let json = serde_json::json!({
            "ts": ts,
            "level": level,
            "message": message,
            "category": category(target),
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            if ring.len() > LOG_RING_CAPACITY {
                ring.pop_front();
            }
        }
    }
}
