//! Host side of the sandbox capability surface.
//!
//! The prelude funnels every capability call through one native function,
//! `__kiln_host_call(op, payloadJson)`, which lands in [`HostBridge::call`].
//! Each op is checked against the instance's [`PluginSecurityGate`] before
//! any side effect. Replies are JSON envelopes:
//! `{"ok":true,"value":...}` or `{"ok":false,"error":{"kind":...,"message":...}}`.
//! A `PermissionDenied` kind is rethrown inside the plugin as the
//! `PermissionDenied` error class; the instance stays usable.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use kiln_storage::ScopedKvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;

use super::fence::MemoryFence;
use super::instance::Deadline;
use crate::plugin::PluginId;
use crate::security::PluginSecurityGate;

/// Cap on a `fetch` response body.
pub(crate) const MAX_FETCH_BODY: usize = 16 * 1024 * 1024;
/// Cap on a single `fs.readFile`.
pub(crate) const MAX_READ_FILE: u64 = 16 * 1024 * 1024;
/// Longest console line forwarded to the log.
const MAX_LOG_MESSAGE_LEN: usize = 16 * 1024;
/// Default and maximum `memory.recall` result counts.
const MAX_RECALL: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostFailure {
    kind: &'static str,
    message: String,
}

impl HostFailure {
    fn denied(message: impl Into<String>) -> Self {
        Self {
            kind: "PermissionDenied",
            message: message.into(),
        }
    }

    fn host(message: impl Into<String>) -> Self {
        Self {
            kind: "HostError",
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: "TypeError",
            message: message.into(),
        }
    }

    fn timeout() -> Self {
        Self {
            kind: "ResourceExceeded",
            message: "time quota exhausted during host call".into(),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Envelope {
    Ok { ok: bool, value: Value },
    Err { ok: bool, error: ErrorBody },
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

fn encode(result: Result<Value, HostFailure>) -> String {
    let envelope = match result {
        Ok(value) => Envelope::Ok { ok: true, value },
        Err(f) => Envelope::Err {
            ok: false,
            error: ErrorBody {
                kind: f.kind,
                message: f.message,
            },
        },
    };
    serde_json::to_string(&envelope).unwrap_or_else(|e| {
        format!(
            r#"{{"ok":false,"error":{{"kind":"HostError","message":"cannot encode reply: {}"}}}}"#,
            e.to_string().replace('"', "'")
        )
    })
}

#[derive(Deserialize)]
struct FetchRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Serialize)]
struct FetchResponse {
    status: u16,
    status_text: String,
    url: String,
    headers: BTreeMap<String, String>,
    body: String,
}

#[derive(Deserialize)]
struct PathRequest {
    path: String,
}

#[derive(Deserialize)]
struct WriteRequest {
    path: String,
    data: String,
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Deserialize)]
struct KeyRequest {
    key: String,
}

#[derive(Deserialize)]
struct SetRequest {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct RecallRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct LogRequest {
    level: String,
    message: String,
}

fn parse<T: for<'de> Deserialize<'de>>(op: &str, payload: &str) -> Result<T, HostFailure> {
    serde_json::from_str(payload)
        .map_err(|e| HostFailure::bad_request(format!("invalid arguments for {op}: {e}")))
}

/// Per-instance capability state. Built from the plugin's permissions when
/// the instance is created and owned by its interpreter thread.
pub(crate) struct HostBridge {
    plugin_id: PluginId,
    gate: Arc<dyn PluginSecurityGate>,
    memory: ScopedKvStore,
    fence: MemoryFence,
    http: reqwest::Client,
    handle: Handle,
    deadline: Deadline,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("plugin_id", &self.plugin_id)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl HostBridge {
    pub(crate) fn new(
        plugin_id: PluginId,
        gate: Arc<dyn PluginSecurityGate>,
        memory: ScopedKvStore,
        fence: MemoryFence,
        http: reqwest::Client,
        handle: Handle,
        deadline: Deadline,
    ) -> Self {
        Self {
            plugin_id,
            gate,
            memory,
            fence,
            http,
            handle,
            deadline,
        }
    }

    /// Handle one host call and return the JSON envelope.
    pub(crate) fn call(&self, op: &str, payload: &str) -> String {
        let result = self.dispatch(op, payload);
        if let Err(failure) = &result
            && failure.kind == "PermissionDenied"
        {
            tracing::warn!(plugin = %self.plugin_id, op, reason = %failure.message, "Capability denied");
        }
        encode(result)
    }

    fn dispatch(&self, op: &str, payload: &str) -> Result<Value, HostFailure> {
        match op {
            "log" => {
                let req: LogRequest = parse(op, payload)?;
                self.log(&req.level, &req.message);
                Ok(Value::Null)
            },
            "fetch" => self.fetch(parse(op, payload)?),
            "fs.read" => self.read_file(&parse::<PathRequest>(op, payload)?.path),
            "fs.write" => {
                let req: WriteRequest = parse(op, payload)?;
                self.write_file(&req.path, &req.data)
            },
            "env.get" => self.env_get(&parse::<NameRequest>(op, payload)?.name),
            "memory.get" => {
                let key = parse::<KeyRequest>(op, payload)?.key;
                let bytes = self.remember(self.memory.get(&key))?;
                Ok(bytes
                    .map(|b| serde_json::from_slice(&b).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null))
            },
            "memory.set" => {
                let req: SetRequest = parse(op, payload)?;
                self.remember(self.memory.set_json(&req.key, &req.value))?;
                Ok(Value::Null)
            },
            "memory.delete" => {
                let key = parse::<KeyRequest>(op, payload)?.key;
                Ok(Value::Bool(self.remember(self.memory.delete(&key))?))
            },
            "memory.exists" => {
                let key = parse::<KeyRequest>(op, payload)?.key;
                Ok(Value::Bool(self.remember(self.memory.exists(&key))?))
            },
            "memory.keys" => {
                let keys = self.remember(self.memory.list_keys())?;
                Ok(Value::from(keys))
            },
            "memory.recall" => {
                let req: RecallRequest = parse(op, payload)?;
                let limit = req.limit.unwrap_or(10).min(MAX_RECALL);
                let hits = self.remember(self.memory.recall(&req.query, limit))?;
                Ok(Value::Array(
                    hits.into_iter()
                        .map(|e| {
                            let value = e.json_value().unwrap_or(Value::Null);
                            serde_json::json!({ "key": e.key, "value": value })
                        })
                        .collect(),
                ))
            },
            other => Err(HostFailure::bad_request(format!("unknown host call '{other}'"))),
        }
    }

    /// Run a memory operation unless the plugin has been removed meanwhile.
    fn remember<T>(
        &self,
        op: impl Future<Output = kiln_storage::StorageResult<T>>,
    ) -> Result<T, HostFailure> {
        self.block(self.fence.guard(op))?
            .ok_or_else(|| HostFailure::host("plugin has been removed"))?
            .map_err(HostFailure::from)
    }

    /// Run `fut` on the host runtime, bounded by the invocation deadline.
    fn block<T>(&self, fut: impl Future<Output = T>) -> Result<T, HostFailure> {
        match self.deadline.remaining() {
            Some(remaining) if remaining.is_zero() => Err(HostFailure::timeout()),
            Some(remaining) => self
                .handle
                .block_on(async { tokio::time::timeout(remaining, fut).await })
                .map_err(|_| HostFailure::timeout()),
            None => Ok(self.handle.block_on(fut)),
        }
    }

    fn log(&self, level: &str, message: &str) {
        let message = truncate(message, MAX_LOG_MESSAGE_LEN);
        let plugin = self.plugin_id.as_str();
        match level {
            "debug" => tracing::debug!(target: "kiln::plugin", plugin, "{message}"),
            "warn" => tracing::warn!(target: "kiln::plugin", plugin, "{message}"),
            "error" => tracing::error!(target: "kiln::plugin", plugin, "{message}"),
            _ => tracing::info!(target: "kiln::plugin", plugin, "{message}"),
        }
    }

    fn fetch(&self, req: FetchRequest) -> Result<Value, HostFailure> {
        let plugin = self.plugin_id.as_str();
        self.block(self.gate.check_http_request(plugin, &req.method, &req.url))?
            .map_err(HostFailure::denied)?;

        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| HostFailure::bad_request(format!("unsupported HTTP method: {}", req.method)))?;

        tracing::debug!(plugin, method = %method, url = %req.url, "Plugin fetch");

        let response = self.block(async {
            let mut builder = self.http.request(method, &req.url);
            for (k, v) in &req.headers {
                builder = builder.header(k, v);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }
            let mut resp = builder
                .send()
                .await
                .map_err(|e| HostFailure::host(format!("HTTP request failed: {e}")))?;

            let status = resp.status();
            let url = resp.url().to_string();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
                .collect();

            let mut body = Vec::new();
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|e| HostFailure::host(format!("failed to read HTTP response body: {e}")))?
            {
                if body.len().saturating_add(chunk.len()) > MAX_FETCH_BODY {
                    return Err(HostFailure::host(format!(
                        "response body exceeds {MAX_FETCH_BODY} bytes"
                    )));
                }
                body.extend_from_slice(&chunk);
            }

            Ok::<_, HostFailure>(FetchResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                url,
                headers,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        })??;

        serde_json::to_value(response)
            .map_err(|e| HostFailure::host(format!("failed to encode HTTP response: {e}")))
    }

    fn read_file(&self, path: &str) -> Result<Value, HostFailure> {
        self.block(self.gate.check_file_read(self.plugin_id.as_str(), path))?
            .map_err(HostFailure::denied)?;

        let meta = std::fs::metadata(path)
            .map_err(|e| HostFailure::host(format!("cannot read '{path}': {e}")))?;
        if meta.len() > MAX_READ_FILE {
            return Err(HostFailure::host(format!(
                "'{path}' is larger than {MAX_READ_FILE} bytes"
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| HostFailure::host(format!("cannot read '{path}': {e}")))?;
        Ok(Value::String(content))
    }

    fn write_file(&self, path: &str, data: &str) -> Result<Value, HostFailure> {
        self.block(self.gate.check_file_write(self.plugin_id.as_str(), path))?
            .map_err(HostFailure::denied)?;

        std::fs::write(path, data)
            .map_err(|e| HostFailure::host(format!("cannot write '{path}': {e}")))?;
        Ok(Value::Null)
    }

    fn env_get(&self, name: &str) -> Result<Value, HostFailure> {
        self.block(self.gate.check_env(self.plugin_id.as_str(), name))?
            .map_err(HostFailure::denied)?;
        Ok(std::env::var(name).map_or(Value::Null, Value::String))
    }
}

impl From<kiln_storage::StorageError> for HostFailure {
    fn from(e: kiln_storage::StorageError) -> Self {
        Self::host(format!("memory: {e}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use kiln_storage::{KvStore, MemoryKvStore};

    use super::*;
    use crate::manifest::PermissionSet;
    use crate::security::ManifestGate;

    fn bridge(perms: &PermissionSet) -> (HostBridge, Arc<MemoryKvStore>) {
        fenced_bridge(perms, MemoryFence::default())
    }

    fn fenced_bridge(perms: &PermissionSet, fence: MemoryFence) -> (HostBridge, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let id = PluginId::new("scout").unwrap();
        let memory = ScopedKvStore::new(store.clone(), id.memory_namespace()).unwrap();
        let bridge = HostBridge::new(
            id,
            Arc::new(ManifestGate::new(perms).unwrap()),
            memory,
            fence,
            reqwest::Client::new(),
            Handle::current(),
            Deadline::new(),
        );
        (bridge, store)
    }

    fn reply(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn denied_fetch_never_leaves_the_host() {
        let (bridge, _) = bridge(&PermissionSet {
            network: vec!["api.example.com".into()],
            ..PermissionSet::default()
        });
        let out = tokio::task::spawn_blocking(move || {
            bridge.call("fetch", r#"{"url":"https://other.example.com/x","method":"GET"}"#)
        })
        .await
        .unwrap();
        let out = reply(&out);
        assert_eq!(out["ok"], false);
        assert_eq!(out["error"]["kind"], "PermissionDenied");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_ops_are_scoped() {
        let (bridge, store) = bridge(&PermissionSet::default());
        let out = tokio::task::spawn_blocking(move || {
            let set = bridge.call("memory.set", r#"{"key":"city","value":{"name":"Oslo"}}"#);
            let get = bridge.call("memory.get", r#"{"key":"city"}"#);
            let missing = bridge.call("memory.get", r#"{"key":"nope"}"#);
            (set, get, missing)
        })
        .await
        .unwrap();
        assert_eq!(reply(&out.0)["ok"], true);
        assert_eq!(reply(&out.1)["value"]["name"], "Oslo");
        assert_eq!(reply(&out.2)["value"], Value::Null);
        assert!(store.exists("plugin:scout", "city").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removed_plugin_cannot_touch_memory() {
        let fence = MemoryFence::default();
        let (bridge, store) = fenced_bridge(&PermissionSet::default(), fence.clone());
        drop(fence.close().await);

        let out = tokio::task::spawn_blocking(move || {
            (
                bridge.call("memory.set", r#"{"key":"city","value":"Oslo"}"#),
                bridge.call("memory.keys", "null"),
            )
        })
        .await
        .unwrap();
        let set = reply(&out.0);
        assert_eq!(set["ok"], false);
        assert_eq!(set["error"]["kind"], "HostError");
        assert_eq!(set["error"]["message"], "plugin has been removed");
        assert_eq!(reply(&out.1)["ok"], false);
        assert!(!store.exists("plugin:scout", "city").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn env_and_write_default_deny() {
        let (bridge, _) = bridge(&PermissionSet::default());
        let out = tokio::task::spawn_blocking(move || {
            (
                bridge.call("env.get", r#"{"name":"HOME"}"#),
                bridge.call("fs.write", r#"{"path":"/tmp/x","data":"y"}"#),
            )
        })
        .await
        .unwrap();
        assert_eq!(reply(&out.0)["error"]["kind"], "PermissionDenied");
        assert_eq!(reply(&out.1)["error"]["kind"], "PermissionDenied");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_op_and_bad_payload() {
        let (bridge, _) = bridge(&PermissionSet::default());
        let out = tokio::task::spawn_blocking(move || {
            (
                bridge.call("proc.spawn", "null"),
                bridge.call("memory.get", "{}"),
            )
        })
        .await
        .unwrap();
        assert_eq!(reply(&out.0)["error"]["kind"], "TypeError");
        assert_eq!(reply(&out.1)["error"]["kind"], "TypeError");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
