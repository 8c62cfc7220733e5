//! One interpreter instance on its own OS thread.
//!
//! `QuickJS` runtimes are not `Send`, so each instance owns a dedicated
//! thread that builds the runtime, loads the prelude and the plugin
//! artifact, then serves [`Job`]s from a channel until its sender is
//! dropped or a quota violation poisons it. Async callers talk to it
//! through `tokio` channels and bound every reply with a timeout of their
//! own, so a wedged instance can never hang the host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value as JsValue};
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use super::capabilities::HostBridge;
use super::context::ExecutionContext;
use crate::error::{PluginError, PluginResult, ResourceKind};
use crate::plugin::PluginId;
use crate::security::PluginSecurityGate;

const PRELUDE: &str = include_str!("prelude.js");

/// Native stack for interpreter threads.
const THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;
/// Interpreter stack ceiling, well inside the thread stack.
const JS_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Extra time the caller waits beyond the quota before giving up on the
/// interrupt handler.
const CALLER_GRACE: Duration = Duration::from_secs(1);

/// Shared invocation deadline, read by the interrupt handler and by host
/// calls. Zero means no deadline is armed.
#[derive(Debug, Clone)]
pub(crate) struct Deadline {
    base: Instant,
    at_ms: Arc<AtomicU64>,
    tripped: Arc<AtomicBool>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            at_ms: Arc::new(AtomicU64::new(0)),
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.base.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn arm(&self, quota: Duration) {
        let quota_ms = u64::try_from(quota.as_millis()).unwrap_or(u64::MAX);
        let at = self.now_ms().saturating_add(quota_ms).max(1);
        self.tripped.store(false, Ordering::SeqCst);
        self.at_ms.store(at, Ordering::SeqCst);
    }

    pub(crate) fn disarm(&self) {
        self.at_ms.store(0, Ordering::SeqCst);
    }

    /// Time left, or `None` when unarmed.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self.at_ms.load(Ordering::SeqCst) {
            0 => None,
            at => Some(Duration::from_millis(at.saturating_sub(self.now_ms()))),
        }
    }

    /// Interrupt-handler body: stop the interpreter once the deadline has
    /// passed, and remember that it did.
    fn interrupt(&self) -> bool {
        if self.remaining().is_some_and(|r| r.is_zero()) {
            self.tripped.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub(crate) fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

/// Handler families, mapped to the `__tool_` / `__skill_` prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    Tool,
    Skill,
}

impl HandlerKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Skill => "skill",
        }
    }
}

/// Work item for an instance.
#[derive(Debug, Clone)]
pub(crate) enum Call {
    Handler {
        kind: HandlerKind,
        name: String,
        args: Value,
    },
    Event {
        event: String,
        payload: Value,
    },
}

impl Call {
    fn label(&self) -> String {
        match self {
            Self::Handler { kind, name, .. } => format!("__{}_{name}", kind.prefix()),
            Self::Event { event, .. } => format!("on:{event}"),
        }
    }
}

/// What a handler did, before result-shape validation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Returned(Value),
    Threw {
        name: String,
        message: String,
        stack: Option<String>,
    },
    Missing,
}

struct Job {
    call: Call,
    context: String,
    reply: oneshot::Sender<PluginResult<Outcome>>,
}

/// Everything needed to build an instance.
pub(crate) struct InstanceSpec {
    pub(crate) plugin_id: PluginId,
    pub(crate) artifact: Arc<str>,
    pub(crate) generation: String,
    pub(crate) gate: Arc<dyn PluginSecurityGate>,
    pub(crate) memory: kiln_storage::ScopedKvStore,
    pub(crate) fence: super::fence::MemoryFence,
    pub(crate) http: reqwest::Client,
    pub(crate) memory_limit: u64,
    pub(crate) quota: Duration,
}

/// Handle to a running instance. Dropping it stops the thread once any
/// in-flight job finishes.
#[derive(Debug)]
pub(crate) struct Instance {
    tx: mpsc::Sender<Job>,
    plugin_id: PluginId,
    generation: String,
    quota: Duration,
    idle_since: Instant,
}

impl Instance {
    /// Start a thread, load the artifact and wait until it is ready.
    pub(crate) async fn spawn(spec: InstanceSpec) -> PluginResult<Self> {
        let (tx, rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = Handle::current();
        let plugin_id = spec.plugin_id.clone();
        let generation = spec.generation.clone();
        let quota = spec.quota;

        std::thread::Builder::new()
            .name(format!("kiln-js-{}", plugin_id.file_stem()))
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || serve(spec, handle, rx, ready_tx))
            .map_err(|e| PluginError::Sandbox {
                plugin: plugin_id.to_string(),
                message: format!("failed to spawn interpreter thread: {e}"),
            })?;

        match tokio::time::timeout(quota.saturating_add(CALLER_GRACE), ready_rx).await {
            Ok(Ok(ready)) => ready?,
            Ok(Err(_)) => {
                return Err(PluginError::Sandbox {
                    plugin: plugin_id.to_string(),
                    message: "interpreter thread exited during startup".into(),
                });
            },
            Err(_) => {
                tracing::warn!(plugin = %plugin_id, "Artifact load exceeded the time quota");
                return Err(PluginError::ResourceExceeded(ResourceKind::Timeout));
            },
        }

        tracing::debug!(plugin = %plugin_id, generation = %generation, "Sandbox instance ready");
        Ok(Self {
            tx,
            plugin_id,
            generation,
            quota,
            idle_since: Instant::now(),
        })
    }

    /// Artifact digest this instance was loaded from.
    pub(crate) fn generation(&self) -> &str {
        &self.generation
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Run one call and wait for the outcome, bounded by the quota.
    pub(crate) async fn run(&self, call: Call, context: &ExecutionContext) -> PluginResult<Outcome> {
        let context = serde_json::to_string(context).map_err(|e| PluginError::Sandbox {
            plugin: self.plugin_id.to_string(),
            message: format!("failed to encode execution context: {e}"),
        })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                call,
                context,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PluginError::Sandbox {
                plugin: self.plugin_id.to_string(),
                message: "instance has shut down".into(),
            })?;

        match tokio::time::timeout(self.quota.saturating_add(CALLER_GRACE), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::Sandbox {
                plugin: self.plugin_id.to_string(),
                message: "instance terminated while handling a call".into(),
            }),
            Err(_) => {
                tracing::warn!(plugin = %self.plugin_id, "Instance did not answer within the quota");
                Err(PluginError::ResourceExceeded(ResourceKind::Timeout))
            },
        }
    }
}

fn serve(
    spec: InstanceSpec,
    handle: Handle,
    mut rx: mpsc::Receiver<Job>,
    ready: oneshot::Sender<PluginResult<()>>,
) {
    let interpreter = match Interpreter::boot(spec, handle) {
        Ok(i) => i,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        },
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Some(job) = rx.blocking_recv() {
        let result = interpreter.execute(&job.call, &job.context);
        let poisoned = matches!(&result, Err(e) if e.is_fatal_to_instance());
        let _ = job.reply.send(result);
        if poisoned {
            tracing::debug!(plugin = %interpreter.plugin_id, "Discarding poisoned instance");
            break;
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Reply {
    Ok {
        #[serde(default)]
        value: Value,
    },
    Threw {
        error: Thrown,
    },
    Missing,
    Pending,
    Invalid {
        reason: String,
    },
}

#[derive(Deserialize)]
struct Thrown {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stack: Option<String>,
    /// Set by the prelude only for the engine's own allocation failures.
    #[serde(default)]
    memory: bool,
}

/// An exception that escaped the dispatch wrapper.
struct Fault {
    message: String,
    memory: bool,
}

impl Fault {
    /// Classify a caught error. Only a failed host-side allocation or an
    /// exception the prelude recognises as the engine's own out-of-memory
    /// error counts as a memory fault; message text is never consulted.
    fn caught<'js>(ctx: &Ctx<'js>, err: CaughtError<'js>) -> Self {
        let memory = match &err {
            CaughtError::Error(rquickjs::Error::Allocation) => true,
            CaughtError::Exception(ex) => ctx
                .globals()
                .get::<_, Function>("__kiln_fault_kind")
                .and_then(|classify| classify.call::<_, String>((ex.as_object().clone(),)))
                .is_ok_and(|kind| kind == "memory"),
            CaughtError::Error(_) | CaughtError::Value(_) => false,
        };
        Self {
            message: err.to_string(),
            memory,
        }
    }

    fn during(mut self, stage: &str) -> Self {
        self.message = format!("{stage}: {}", self.message);
        self
    }
}

// Field order matters: the context must drop before its runtime.
struct Interpreter {
    context: Context,
    runtime: Runtime,
    deadline: Deadline,
    plugin_id: PluginId,
    quota: Duration,
}

impl Interpreter {
    fn boot(spec: InstanceSpec, handle: Handle) -> PluginResult<Self> {
        let plugin = spec.plugin_id.to_string();
        let sandbox_err = |message: String| PluginError::Sandbox {
            plugin: plugin.clone(),
            message,
        };

        let runtime =
            Runtime::new().map_err(|e| sandbox_err(format!("failed to create runtime: {e}")))?;
        runtime.set_memory_limit(usize::try_from(spec.memory_limit).unwrap_or(usize::MAX));
        runtime.set_max_stack_size(JS_STACK_SIZE);

        let deadline = Deadline::new();
        let watch = deadline.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || watch.interrupt())));

        let context = Context::full(&runtime)
            .map_err(|e| sandbox_err(format!("failed to create context: {e}")))?;

        let bridge = HostBridge::new(
            spec.plugin_id.clone(),
            spec.gate,
            spec.memory,
            spec.fence,
            spec.http,
            handle,
            deadline.clone(),
        );

        let interpreter = Self {
            context,
            runtime,
            deadline,
            plugin_id: spec.plugin_id,
            quota: spec.quota,
        };

        interpreter.deadline.arm(interpreter.quota);
        let loaded = interpreter.context.with(|ctx| -> Result<(), Fault> {
            let host_call = Function::new(ctx.clone(), move |op: String, payload: String| {
                bridge.call(&op, &payload)
            })
            .catch(&ctx)
            .map_err(|e| Fault::caught(&ctx, e))?;
            ctx.globals()
                .set("__kiln_host_call", host_call)
                .catch(&ctx)
                .map_err(|e| Fault::caught(&ctx, e))?;

            let init: Function = ctx
                .globals()
                .get::<_, Function>("eval")
                .and_then(|eval| eval.call((PRELUDE,)))
                .catch(&ctx)
                .map_err(|e| Fault::caught(&ctx, e).during("prelude"))?;
            init.call::<_, ()>((ctx.globals(), interpreter.plugin_id.as_str()))
                .catch(&ctx)
                .map_err(|e| Fault::caught(&ctx, e).during("prelude"))?;

            ctx.eval::<JsValue, _>(spec.artifact.as_bytes())
                .catch(&ctx)
                .map_err(|e| Fault::caught(&ctx, e).during("artifact"))?;
            Ok(())
        });
        let loaded = loaded
            .map_err(|f| interpreter.fault("load", f))
            .and_then(|()| interpreter.drain_jobs());
        interpreter.deadline.disarm();
        loaded?;

        Ok(interpreter)
    }

    fn execute(&self, call: &Call, context: &str) -> PluginResult<Outcome> {
        self.deadline.arm(self.quota);
        let result = self.execute_armed(call, context);
        self.deadline.disarm();
        result
    }

    fn execute_armed(&self, call: &Call, context: &str) -> PluginResult<Outcome> {
        let label = call.label();
        let (entry, head, name, payload) = match call {
            Call::Handler { kind, name, args } => {
                ("__kiln_dispatch", Some(kind.prefix()), name.as_str(), args)
            },
            Call::Event { event, payload } => ("__kiln_emit", None, event.as_str(), payload),
        };
        let payload = serde_json::to_string(payload).map_err(|e| PluginError::Sandbox {
            plugin: self.plugin_id.to_string(),
            message: format!("failed to encode arguments: {e}"),
        })?;

        let first = self.context.with(|ctx| -> Result<String, Fault> {
            let f: Function = ctx
                .globals()
                .get(entry)
                .catch(&ctx)
                .map_err(|e| Fault::caught(&ctx, e))?;
            let out = match head {
                Some(prefix) => f.call::<_, String>((prefix, name, payload.as_str(), context)),
                None => f.call::<_, String>((name, payload.as_str(), context)),
            };
            out.catch(&ctx).map_err(|e| Fault::caught(&ctx, e))
        });
        let raw = first.map_err(|f| self.fault(&label, f))?;

        let mut reply = decode(&label, &raw)?;
        if matches!(reply, Reply::Pending) {
            self.drain_jobs()?;
            let raw = self
                .context
                .with(|ctx| -> Result<String, Fault> {
                    let take: Function = ctx
                        .globals()
                        .get("__kiln_take_pending")
                        .catch(&ctx)
                        .map_err(|e| Fault::caught(&ctx, e))?;
                    take.call::<_, String>(())
                        .catch(&ctx)
                        .map_err(|e| Fault::caught(&ctx, e))
                })
                .map_err(|f| self.fault(&label, f))?;
            reply = decode(&label, &raw)?;
        }

        if self.deadline.tripped() {
            return Err(self.timed_out());
        }

        match reply {
            Reply::Ok { value } => Ok(Outcome::Returned(value)),
            Reply::Threw { error } if error.memory => {
                tracing::warn!(plugin = %self.plugin_id, handler = %label, "Instance exceeded its memory ceiling");
                Err(PluginError::ResourceExceeded(ResourceKind::Memory))
            },
            Reply::Threw { error } => Ok(Outcome::Threw {
                name: error.name,
                message: error.message,
                stack: error.stack,
            }),
            Reply::Missing => Ok(Outcome::Missing),
            Reply::Pending => Err(PluginError::InvalidResult {
                handler: label,
                reason: "returned a promise that never settled".into(),
            }),
            Reply::Invalid { reason } => Err(PluginError::InvalidResult {
                handler: label,
                reason,
            }),
        }
    }

    /// Run queued promise jobs until the queue is empty.
    fn drain_jobs(&self) -> PluginResult<()> {
        loop {
            if self.deadline.tripped() {
                return Err(self.timed_out());
            }
            match self.runtime.execute_pending_job() {
                Ok(true) => {},
                Ok(false) => return Ok(()),
                Err(_) => {
                    if self.deadline.tripped() {
                        return Err(self.timed_out());
                    }
                    tracing::debug!(plugin = %self.plugin_id, "Promise job raised an exception");
                },
            }
        }
    }

    fn timed_out(&self) -> PluginError {
        tracing::warn!(plugin = %self.plugin_id, quota_ms = self.quota.as_millis(), "Invocation exceeded the time quota");
        PluginError::ResourceExceeded(ResourceKind::Timeout)
    }

    /// Classify an exception that escaped the dispatch wrapper.
    fn fault(&self, label: &str, fault: Fault) -> PluginError {
        if self.deadline.tripped() {
            self.timed_out()
        } else if fault.memory {
            tracing::warn!(plugin = %self.plugin_id, handler = label, "Instance exceeded its memory ceiling");
            PluginError::ResourceExceeded(ResourceKind::Memory)
        } else {
            PluginError::Sandbox {
                plugin: self.plugin_id.to_string(),
                message: format!("{label}: {}", fault.message),
            }
        }
    }
}

fn decode(label: &str, raw: &str) -> PluginResult<Reply> {
    serde_json::from_str(raw).map_err(|e| PluginError::InvalidResult {
        handler: label.to_string(),
        reason: format!("malformed dispatch reply: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_arms_and_trips() {
        let d = Deadline::new();
        assert_eq!(d.remaining(), None);
        assert!(!d.interrupt());

        d.arm(Duration::from_secs(60));
        assert!(d.remaining().unwrap() > Duration::from_secs(59));
        assert!(!d.interrupt());

        d.arm(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.interrupt());
        assert!(d.tripped());

        d.arm(Duration::from_secs(1));
        assert!(!d.tripped());
        d.disarm();
        assert_eq!(d.remaining(), None);
    }

    #[test]
    fn memory_flag_comes_only_from_the_envelope() {
        let raw = r#"{"kind":"threw","error":{"name":"Error","message":"out of memory"}}"#;
        let Reply::Threw { error } = decode("t", raw).unwrap() else {
            panic!("expected a thrown reply");
        };
        assert!(!error.memory);

        let raw = r#"{"kind":"threw","error":{"name":"InternalError","message":"out of memory","memory":true}}"#;
        let Reply::Threw { error } = decode("t", raw).unwrap() else {
            panic!("expected a thrown reply");
        };
        assert!(error.memory);
    }

    #[test]
    fn reply_shapes_decode() {
        assert!(matches!(decode("t", r#"{"kind":"missing"}"#).unwrap(), Reply::Missing));
        assert!(matches!(
            decode("t", r#"{"kind":"ok"}"#).unwrap(),
            Reply::Ok { value: Value::Null }
        ));
        assert!(decode("t", "not json").is_err());
    }
}
