//! Registered work callbacks, resolved at task-creation time.
//!
//! Step definitions arrive over the wire as `{kind, name, params, …}`; the
//! engine itself only accepts an injected work capability per step, so the
//! server keeps a library mapping each `kind` to one. Embedding applications
//! register their own kinds next to the built-ins:
//!
//! - `sleep`      – simulated work (`{"duration_ms": u64}`)
//! - `http.fetch` – fetch a resource, record size + sha-256 in the snapshot
//! - `digest`     – sha-256 over the canonical JSON of the current snapshot

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use marathon_core::{StepDefinition, StepFn, StepOutput, StepResult, StepWork, WorkContext};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::ServerError;
use crate::schemas::task::StepSpec;

/// Work-callback registry keyed by step kind.
pub struct WorkLibrary {
    kinds: HashMap<String, Arc<dyn StepWork>>,
}

impl fmt::Debug for WorkLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("WorkLibrary").field("kinds", &kinds).finish()
    }
}

impl Default for WorkLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkLibrary {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// The library with the built-in kinds registered.
    pub fn with_builtins() -> Self {
        let mut library = Self::new();
        library.register("sleep", Arc::new(StepFn(sleep_step)));

        let client = reqwest::Client::builder()
            .user_agent(concat!("marathon-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        library.register(
            "http.fetch",
            Arc::new(StepFn(move |ctx: WorkContext| {
                fetch_step(client.clone(), ctx)
            })),
        );

        library.register("digest", Arc::new(StepFn(digest_step)));
        library
    }

    /// Register (or replace) a work capability under a step kind.
    pub fn register(&mut self, kind: impl Into<String>, work: Arc<dyn StepWork>) {
        self.kinds.insert(kind.into(), work);
    }

    /// Resolve one wire-level step spec into an executable definition.
    ///
    /// An unknown kind is a malformed creation request: no task is created.
    pub fn resolve(&self, spec: &StepSpec) -> Result<StepDefinition, ServerError> {
        let work = self
            .kinds
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| ServerError::BadRequest(format!("unknown step kind: {}", spec.kind)))?;

        let name = spec.name.clone().unwrap_or_else(|| spec.kind.clone());
        let mut definition = StepDefinition::with_work(name, work);
        if let Some(description) = &spec.description {
            definition = definition.description(description.clone());
        }
        if let Some(max_retries) = spec.max_retries {
            definition = definition.max_retries(max_retries);
        }
        if let Some(weight) = spec.weight {
            definition = definition.weight(weight);
        }
        if let Some(params) = &spec.params {
            definition = definition.params(params.clone());
        }
        Ok(definition)
    }
}

// ── Built-in callbacks ────────────────────────────────────────────────────────

async fn sleep_step(ctx: WorkContext) -> StepResult {
    let duration_ms = ctx
        .params
        .get("duration_ms")
        .and_then(Value::as_u64)
        .unwrap_or(1000);
    tokio::time::sleep(Duration::from_millis(duration_ms)).await;
    Ok(StepOutput {
        state: ctx.state,
        result: json!({ "slept_ms": duration_ms }),
    })
}

async fn fetch_step(client: reqwest::Client, ctx: WorkContext) -> StepResult {
    let url = ctx
        .params
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| "http.fetch requires a 'url' param".to_owned())?
        .to_owned();
    let state_key = ctx
        .params
        .get("state_key")
        .and_then(Value::as_str)
        .unwrap_or("payload")
        .to_owned();

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("fetch failed: HTTP {status}"));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| format!("reading body failed: {e}"))?;

    let record = json!({
        "url": url,
        "status": status.as_u16(),
        "content_length": body.len(),
        "sha256": hex_digest(&body),
    });

    // The body itself stays out of the snapshot; a digest and size are enough
    // for downstream steps to verify against.
    let mut state = ctx.state;
    if !state.is_object() {
        state = json!({});
    }
    state[state_key.as_str()] = record.clone();
    Ok(StepOutput {
        state,
        result: record,
    })
}

async fn digest_step(ctx: WorkContext) -> StepResult {
    let bytes =
        serde_json::to_vec(&ctx.state).map_err(|e| format!("state not serializable: {e}"))?;
    let digest = hex_digest(&bytes);

    let mut state = ctx.state;
    if !state.is_object() {
        state = json!({});
    }
    state["digest"] = json!(digest);
    Ok(StepOutput {
        state,
        result: json!({ "sha256": digest, "bytes": bytes.len() }),
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    fn spec(kind: &str) -> StepSpec {
        StepSpec {
            kind: kind.to_owned(),
            name: None,
            description: None,
            max_retries: None,
            weight: None,
            params: None,
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let library = WorkLibrary::with_builtins();
        let err = library.resolve(&spec("no-such-kind")).unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[test]
    fn resolve_applies_spec_fields() {
        let library = WorkLibrary::with_builtins();
        let definition = library
            .resolve(&StepSpec {
                kind: "sleep".to_owned(),
                name: Some("warmup".to_owned()),
                description: Some("simulated warmup".to_owned()),
                max_retries: Some(3),
                weight: Some(2),
                params: Some(json!({ "duration_ms": 5 })),
            })
            .expect("resolve should succeed");
        assert_eq!(definition.name, "warmup");
        assert_eq!(definition.max_retries, 3);
        assert_eq!(definition.weight, 2);
        assert_eq!(definition.params["duration_ms"], 5);
    }

    #[test]
    fn resolve_defaults_name_to_kind() {
        let library = WorkLibrary::with_builtins();
        let definition = library.resolve(&spec("digest")).expect("resolve");
        assert_eq!(definition.name, "digest");
        assert_eq!(definition.max_retries, 1);
    }

    #[tokio::test]
    async fn digest_step_is_deterministic() {
        let (_tx, cancel) = tokio::sync::watch::channel(false);
        let ctx = WorkContext {
            state: json!({ "payload": "abc" }),
            params: Value::Null,
            cancel,
        };
        let first = digest_step(ctx.clone()).await.expect("digest");
        let second = digest_step(ctx).await.expect("digest");
        assert_eq!(first.result["sha256"], second.result["sha256"]);
        assert_eq!(
            first.result["sha256"].as_str().map(str::len),
            Some(64),
            "sha-256 hex is 64 chars"
        );
        assert!(first.state["digest"].is_string());
    }
}
