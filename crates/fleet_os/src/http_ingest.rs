#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use fleet_contracts::event::EventDraft;
use fleet_contracts::ids::EventId;
use fleet_storage::event_store::EventStore;
use fleet_storage::repo::IngestionBoundary;
use fleet_storage::{IngestError, MalformedEventPayload, TransientNetworkError};
use serde::Deserialize;

pub const INGEST_RETRY_AFTER_MS_DEFAULT: u32 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpIngestConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl HttpIngestConfig {
    /// `None` unless `FLEET_INGEST_ENDPOINT` names a remote ingestion service.
    pub fn from_env() -> Option<Self> {
        let endpoint = env::var("FLEET_INGEST_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }
        let bearer_token = env::var("FLEET_INGEST_BEARER")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let connect_timeout_ms = env::var("FLEET_INGEST_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(3_000);
        let request_timeout_ms = env::var("FLEET_INGEST_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| (100..=120_000).contains(v))
            .unwrap_or(10_000);
        Some(Self {
            endpoint,
            bearer_token,
            connect_timeout_ms,
            request_timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ack,
    Malformed,
    Transient,
}

/// 2xx acknowledges; 4xx other than 408 and 429 means the payload itself was refused.
pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Ack,
        408 | 429 => ResponseClass::Transient,
        400..=499 => ResponseClass::Malformed,
        _ => ResponseClass::Transient,
    }
}

/// `Retry-After` in whole seconds, bounded to 1 s..=300 s.
pub fn parse_retry_after_ms(header: Option<&str>) -> u32 {
    let Some(header) = header else {
        return INGEST_RETRY_AFTER_MS_DEFAULT;
    };
    header
        .trim()
        .parse::<u32>()
        .ok()
        .map(|s| s.saturating_mul(1_000))
        .filter(|ms| (1_000..=300_000).contains(ms))
        .unwrap_or(INGEST_RETRY_AFTER_MS_DEFAULT)
}

#[derive(Debug, Deserialize)]
struct IngestAck {
    id: EventId,
}

/// Posts drafts to a remote ingestion service. The idempotency key travels as a header
/// so a retried post after a lost acknowledgment resolves to the original id.
#[derive(Clone)]
pub struct HttpIngestClient {
    config: Arc<HttpIngestConfig>,
    agent: ureq::Agent,
}

impl HttpIngestClient {
    pub fn new(config: HttpIngestConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Self {
            config: Arc::new(config),
            agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

impl IngestionBoundary for HttpIngestClient {
    async fn insert_event(&self, draft: EventDraft) -> Result<EventId, IngestError> {
        let agent = self.agent.clone();
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || post_draft(&agent, &config, &draft))
            .await
            .map_err(|e| TransientNetworkError::new(format!("ingest task failed: {e}")))?
    }
}

fn post_draft(
    agent: &ureq::Agent,
    config: &HttpIngestConfig,
    draft: &EventDraft,
) -> Result<EventId, IngestError> {
    let payload = serde_json::to_string(draft).map_err(|e| MalformedEventPayload {
        reason: format!("draft encode failed: {e}"),
    })?;
    let mut req = agent
        .post(&config.endpoint)
        .set("content-type", "application/json")
        .set("idempotency-key", &draft.idempotency_key);
    if let Some(token) = config.bearer_token.as_ref() {
        req = req.set("authorization", &format!("Bearer {token}"));
    }
    match req.send_string(&payload) {
        Ok(resp) => {
            let status = resp.status();
            if classify_status(status) != ResponseClass::Ack {
                let retry_after = parse_retry_after_ms(resp.header("retry-after"));
                return Err(TransientNetworkError::with_retry_after(
                    format!("ingest failed with http status {status}"),
                    retry_after,
                )
                .into());
            }
            let ack: IngestAck = resp.into_json().map_err(|e| {
                TransientNetworkError::new(format!("ingest ack unreadable: {e}"))
            })?;
            Ok(ack.id)
        }
        Err(ureq::Error::Status(code, resp)) => match classify_status(code) {
            ResponseClass::Malformed => {
                let body = resp.into_string().unwrap_or_default();
                Err(MalformedEventPayload {
                    reason: format!("http {code}: {}", body.chars().take(200).collect::<String>()),
                }
                .into())
            }
            _ => {
                let retry_after = parse_retry_after_ms(resp.header("retry-after"));
                Err(TransientNetworkError::with_retry_after(
                    format!("ingest failed with http status {code}"),
                    retry_after,
                )
                .into())
            }
        },
        Err(ureq::Error::Transport(err)) => Err(TransientNetworkError::with_retry_after(
            format!("ingest transport error: {err}"),
            INGEST_RETRY_AFTER_MS_DEFAULT,
        )
        .into()),
    }
}

/// Where recorded events go: the in-process store, or a remote ingestion service whose
/// acknowledged events are mirrored into a local store so the live views see them.
#[derive(Clone)]
pub enum IngestTarget {
    Local(EventStore),
    Remote {
        client: HttpIngestClient,
        mirror: EventStore,
    },
}

impl IngestionBoundary for IngestTarget {
    async fn insert_event(&self, draft: EventDraft) -> Result<EventId, IngestError> {
        match self {
            IngestTarget::Local(store) => store.insert(draft),
            IngestTarget::Remote { client, mirror } => {
                let id = client.insert_event(draft.clone()).await?;
                if let Err(err) = mirror.mirror_acknowledged(id.clone(), draft) {
                    tracing::warn!(
                        event_id = %id,
                        endpoint = client.endpoint(),
                        error = %err,
                        "acknowledged event not mirrored locally"
                    );
                }
                Ok(id)
            }
        }
    }
}
