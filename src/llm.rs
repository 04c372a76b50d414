//! Language-model client.
//!
//! [`LanguageModel`] abstracts the completion provider behind the engine:
//! plain and streaming generation, plus the two narrow classification tasks
//! the retrieval pipeline needs (intent detection and entity extraction),
//! which default to prompt-based implementations over `generate`.
//!
//! [`HttpLm`] talks to any OpenAI-compatible `/chat/completions` endpoint
//! (LM Studio, vLLM, a gateway). [`MockLm`] is the scripted double used by
//! the test suite and offline development.
//!
//! LM replies are free-form text; the extraction parser is deliberately
//! defensive (fence stripping, tolerated missing fields) and callers fall
//! back rather than fail when classification output is unusable.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Query intent classes used by the mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Factual,
    Comparative,
    Temporal,
    Causal,
    Exploratory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub label: String,
    pub confidence: Option<f64>,
}

/// Entities and relations mined from a piece of text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

const INTENT_PROMPT: &str = "Classify the intent of the following query as exactly one of: \
factual, comparative, temporal, causal, exploratory.\n\
Reply with the single word only.\n\nQuery: ";

const EXTRACTION_PROMPT: &str = "Extract named entities and relations from the text below.\n\
Reply with JSON only, in this shape:\n\
{\"entities\": [{\"name\": \"...\", \"type\": \"person|organization|concept|place\"}],\n \
\"relations\": [{\"source\": \"...\", \"target\": \"...\", \"label\": \"...\", \"confidence\": 0.0}]}\n\nText:\n";

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;

    /// Lazy, finite, non-restartable stream of answer fragments in provider
    /// order. Dropping the stream closes the upstream connection.
    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String>>>;

    /// Fast health probe used by system status; never errors.
    async fn check_connection(&self) -> bool;

    async fn detect_intent(&self, query: &str) -> Result<Intent> {
        let reply = self
            .generate(&format!("{}{}", INTENT_PROMPT, query), None, 0.0, 10)
            .await?;
        Ok(parse_intent(&reply))
    }

    async fn extract_entities(&self, text: &str) -> Result<Extraction> {
        let reply = self
            .generate(&format!("{}{}", EXTRACTION_PROMPT, text), None, 0.1, 512)
            .await?;
        parse_extraction(&reply)
    }
}

/// Retry `generate` on transient upstream failures with capped exponential
/// backoff (1s, 2s, 4s, ... capped at 32s). Non-transient failures and the
/// final transient failure surface to the caller.
pub async fn generate_with_retry(
    lm: &dyn LanguageModel,
    prompt: &str,
    system: Option<&str>,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
) -> Result<String> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match lm.generate(prompt, system, temperature, max_tokens).await {
            Ok(answer) => return Ok(answer),
            Err(e) if e.is_transient() => {
                tracing::warn!(attempt, error = %e, "LM call failed, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::Upstream("generation failed".to_string())))
}

fn parse_intent(reply: &str) -> Intent {
    let lower = reply.to_lowercase();
    if lower.contains("comparative") {
        Intent::Comparative
    } else if lower.contains("temporal") {
        Intent::Temporal
    } else if lower.contains("causal") {
        Intent::Causal
    } else if lower.contains("exploratory") {
        Intent::Exploratory
    } else {
        Intent::Factual
    }
}

/// Parse an extraction reply. Tolerates fenced code blocks, leading prose,
/// and missing fields; a reply with no JSON object at all is an upstream
/// error (callers fall back to token heuristics).
pub fn parse_extraction(reply: &str) -> Result<Extraction> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) if e > s => (s, e),
        _ => {
            return Err(EngineError::Upstream(
                "extraction reply contained no JSON object".to_string(),
            ))
        }
    };

    let json: serde_json::Value = serde_json::from_str(&reply[start..=end])
        .map_err(|e| EngineError::Upstream(format!("extraction reply was not valid JSON: {}", e)))?;

    let mut extraction = Extraction::default();

    if let Some(entities) = json.get("entities").and_then(|v| v.as_array()) {
        for item in entities {
            let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if name.trim().is_empty() {
                continue;
            }
            let entity_type = item
                .get("type")
                .or_else(|| item.get("entity_type"))
                .and_then(|v| v.as_str())
                .unwrap_or("concept");
            extraction.entities.push(ExtractedEntity {
                name: name.trim().to_string(),
                entity_type: entity_type.trim().to_string(),
            });
        }
    }

    if let Some(relations) = json.get("relations").and_then(|v| v.as_array()) {
        for item in relations {
            let source = item
                .get("source")
                .or_else(|| item.get("src"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let target = item
                .get("target")
                .or_else(|| item.get("dst"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if source.trim().is_empty() || target.trim().is_empty() {
                continue;
            }
            let label = item
                .get("label")
                .or_else(|| item.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("related-to");
            extraction.relations.push(ExtractedRelation {
                source: source.trim().to_string(),
                target: target.trim().to_string(),
                label: label.trim().to_string(),
                confidence: item.get("confidence").and_then(|v| v.as_f64()),
            });
        }
    }

    Ok(extraction)
}

// ============ HTTP client ============

/// OpenAI-compatible chat-completions client with a pooled connection and a
/// per-call timeout.
pub struct HttpLm {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpLm {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn request_body(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
        stream: bool,
    ) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(serde_json::json!({"role": "system", "content": sys}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": stream,
        })
    }

    async fn post_completion(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamTransient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(EngineError::UpstreamTransient(format!(
                "LM API error {}: {}",
                status, text
            )))
        } else {
            Err(EngineError::Upstream(format!(
                "LM API error {}: {}",
                status, text
            )))
        }
    }
}

#[async_trait]
impl LanguageModel for HttpLm {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let body = self.request_body(prompt, system, temperature, max_tokens, false);
        let resp = self.post_completion(body).await?;

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Upstream("LM response missing content".to_string()))?;

        Ok(content.trim().to_string())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let body = self.request_body(prompt, system, temperature, max_tokens, true);
        let resp = self.post_completion(body).await?;

        let (mut tx, rx) = mpsc::unbounded::<Result<String>>();

        // Drive the SSE body on a task; when the receiver is dropped the
        // sends fail, the task returns, and the response body is closed.
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buf = String::new();

            while let Some(item) = bytes.next().await {
                let data = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::UpstreamTransient(e.to_string())))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&data));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }

                    let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
                        continue;
                    };
                    let content = json
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(|v| v.as_str());

                    if let Some(text) = content {
                        if !text.is_empty() && tx.send(Ok(text.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx.boxed())
    }

    async fn check_connection(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ============ Scripted double ============

/// Scripted language model for tests and offline runs. Generate replies
/// cycle through the configured list; intent and extraction can be scripted
/// directly or forced to fail to exercise the fallbacks.
pub struct MockLm {
    replies: Vec<String>,
    next_reply: AtomicUsize,
    stream_chunks: Vec<String>,
    intent: Option<Intent>,
    extraction: Option<Extraction>,
    connected: bool,
    /// Number of initial `generate` calls that fail transiently.
    transient_failures: AtomicU32,
}

impl MockLm {
    pub fn new(reply: &str) -> Self {
        Self {
            replies: vec![reply.to_string()],
            next_reply: AtomicUsize::new(0),
            stream_chunks: vec![reply.to_string()],
            intent: Some(Intent::Factual),
            extraction: Some(Extraction::default()),
            connected: true,
            transient_failures: AtomicU32::new(0),
        }
    }

    pub fn with_replies(mut self, replies: &[&str]) -> Self {
        self.replies = replies.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_stream_chunks(mut self, chunks: &[&str]) -> Self {
        self.stream_chunks = chunks.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    /// Make `detect_intent` fail, exercising the selector's zero-contribution
    /// fallback.
    pub fn failing_intent(mut self) -> Self {
        self.intent = None;
        self
    }

    pub fn with_extraction(mut self, extraction: Extraction) -> Self {
        self.extraction = Some(extraction);
        self
    }

    /// Make `extract_entities` fail, exercising the token fallback.
    pub fn failing_extraction(mut self) -> Self {
        self.extraction = None;
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }

    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl LanguageModel for MockLm {
    async fn generate(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String> {
        loop {
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(EngineError::UpstreamTransient("scripted failure".to_string()));
            }
        }

        let idx = self.next_reply.fetch_add(1, Ordering::SeqCst) % self.replies.len();
        Ok(self.replies[idx].clone())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let chunks: Vec<Result<String>> =
            self.stream_chunks.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn check_connection(&self) -> bool {
        self.connected
    }

    async fn detect_intent(&self, _query: &str) -> Result<Intent> {
        self.intent
            .ok_or_else(|| EngineError::Upstream("scripted intent failure".to_string()))
    }

    async fn extract_entities(&self, _text: &str) -> Result<Extraction> {
        self.extraction
            .clone()
            .ok_or_else(|| EngineError::Upstream("scripted extraction failure".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_intent_variants() {
        assert_eq!(parse_intent("comparative"), Intent::Comparative);
        assert_eq!(parse_intent("The intent is TEMPORAL."), Intent::Temporal);
        assert_eq!(parse_intent("causal"), Intent::Causal);
        assert_eq!(parse_intent("exploratory query"), Intent::Exploratory);
        assert_eq!(parse_intent("factual"), Intent::Factual);
        assert_eq!(parse_intent("no idea"), Intent::Factual);
    }

    #[test]
    fn test_parse_extraction_plain_json() {
        let reply = r#"{"entities": [{"name": "Marie Curie", "type": "person"}],
            "relations": [{"source": "Marie Curie", "target": "Sorbonne", "label": "works-at", "confidence": 0.9}]}"#;
        let extraction = parse_extraction(reply).unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].name, "Marie Curie");
        assert_eq!(extraction.entities[0].entity_type, "person");
        assert_eq!(extraction.relations.len(), 1);
        assert_eq!(extraction.relations[0].label, "works-at");
        assert_eq!(extraction.relations[0].confidence, Some(0.9));
    }

    #[test]
    fn test_parse_extraction_fenced_with_prose() {
        let reply = "Here you go:\n```json\n{\"entities\": [{\"name\": \"Tokyo\", \"type\": \"place\"}], \"relations\": []}\n```";
        let extraction = parse_extraction(reply).unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].name, "Tokyo");
    }

    #[test]
    fn test_parse_extraction_alternate_keys_and_defaults() {
        let reply = r#"{"entities": [{"name": "ACME"}],
            "relations": [{"src": "ACME", "dst": "Widgets", "type": "produces"}]}"#;
        let extraction = parse_extraction(reply).unwrap();
        assert_eq!(extraction.entities[0].entity_type, "concept");
        assert_eq!(extraction.relations[0].source, "ACME");
        assert_eq!(extraction.relations[0].target, "Widgets");
        assert_eq!(extraction.relations[0].label, "produces");
        assert_eq!(extraction.relations[0].confidence, None);
    }

    #[test]
    fn test_parse_extraction_no_json_is_error() {
        assert!(parse_extraction("I could not find any entities.").is_err());
    }

    #[test]
    fn test_parse_extraction_skips_nameless_entries() {
        let reply = r#"{"entities": [{"name": "  "}, {"name": "Kept", "type": "concept"}],
            "relations": [{"source": "", "target": "x", "label": "l"}]}"#;
        let extraction = parse_extraction(reply).unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert!(extraction.relations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let lm = MockLm::new("recovered").with_transient_failures(2);
        let answer = generate_with_retry(&lm, "q", None, 0.3, 128, 3).await.unwrap();
        assert_eq!(answer, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let lm = MockLm::new("never").with_transient_failures(10);
        let err = generate_with_retry(&lm, "q", None, 0.3, 128, 2).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_mock_stream_yields_scripted_chunks() {
        let lm = MockLm::new("x").with_stream_chunks(&["Hel", "lo"]);
        let mut stream = lm.generate_stream("q", None, 0.3, 64).await.unwrap();
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "Hello");
    }
}
