// Both backends against a one-shot local HTTP responder.

use lawhelp_core::completion::{ChatMessage, CompletionBackend, CompletionRequest};
use lawhelp_llm::{OllamaBackend, OpenAiBackend};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
};
use tracing_test::traced_test;

/// Serve exactly one request with `status` and a JSON `body`. The raw
/// request is sent back through the returned channel.
async fn respond_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        // Read until the headers and the declared body have arrived.
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
    });
    (format!("http://{addr}"), rx)
}

fn question() -> CompletionRequest {
    CompletionRequest::new(
        vec![
            ChatMessage::system("You are a legal assistant."),
            ChatMessage::user("What is a tort?"),
        ],
        0.6,
    )
}

#[tokio::test]
async fn test_openai_returns_first_choice() {
    let (base, seen) = respond_once(
        "200 OK",
        r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"A tort is a civil wrong."}}]}"#,
    )
    .await;
    let backend = OpenAiBackend::new("sk-test", base, "gpt-4o-mini", 10).unwrap();

    let reply = backend.complete(question()).await.unwrap();
    assert_eq!(reply, "A tort is a civil wrong.");

    let raw = seen.await.unwrap();
    assert!(raw.starts_with("POST /chat/completions"));
    assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    assert!(raw.contains(r#""temperature":0.6"#));
}

#[tokio::test]
#[traced_test]
async fn test_openai_non_success_is_error() {
    let (base, _seen) = respond_once("429 Too Many Requests", r#"{"error":{"message":"slow down"}}"#).await;
    let backend = OpenAiBackend::new("sk-test", base, "gpt-4o-mini", 10).unwrap();

    let err = backend.complete(question()).await.unwrap_err();
    assert!(err.to_string().contains("429"));
    assert!(logs_contain("openai returned non-200"));
}

#[tokio::test]
async fn test_ollama_returns_message_content() {
    let (base, seen) = respond_once(
        "200 OK",
        r#"{"model":"llama3","message":{"role":"assistant","content":"A tort is a civil wrong."},"done":true}"#,
    )
    .await;
    let backend = OllamaBackend::new(base, "llama3").with_timeout(10);

    let reply = backend.complete(question()).await.unwrap();
    assert_eq!(reply, "A tort is a civil wrong.");

    let raw = seen.await.unwrap();
    assert!(raw.starts_with("POST /api/chat"));
    assert!(raw.contains(r#""stream":false"#));
}

#[tokio::test]
#[traced_test]
async fn test_ollama_unreachable_is_error() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let backend = OllamaBackend::new(format!("http://127.0.0.1:{port}"), "llama3").with_timeout(5);

    assert!(backend.complete(question()).await.is_err());
    assert!(logs_contain("ollama request failed"));
}
