//! Process-wide callback and code-function registries.
//!
//! Both registries follow a two-phase lifecycle: writable while the
//! platform boots, frozen before the first workflow is served. After
//! [`freeze`] every registration attempt fails and reads are effectively
//! lock-free (the `RwLock` is never contended by writers again).
//!
//! - The **callback registry** holds named observational hooks a workflow
//!   may attach to its agents (`before_agent`, `after_tool`, …). The
//!   hydrator resolves callback names here and fails loudly on unknowns.
//! - The **function registry** backs code agents. The declarative
//!   `function: pricing.parse_params` path resolves to a callable
//!   registered at process start; explicit registration replaces the
//!   dynamic imports a scripting runtime would use. Sync callables are
//!   dispatched through `spawn_blocking` so they never stall the
//!   scheduler.

use futures_util::future::BoxFuture;
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock};

/// The six hook points a workflow can attach callbacks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeAgent,
    AfterAgent,
    BeforeTool,
    AfterTool,
    BeforeModel,
    AfterModel,
}

impl HookPoint {
    /// Parse the YAML hook-point key.
    pub fn parse(name: &str) -> Option<HookPoint> {
        match name {
            "before_agent" => Some(HookPoint::BeforeAgent),
            "after_agent" => Some(HookPoint::AfterAgent),
            "before_tool" => Some(HookPoint::BeforeTool),
            "after_tool" => Some(HookPoint::AfterTool),
            "before_model" => Some(HookPoint::BeforeModel),
            "after_model" => Some(HookPoint::AfterModel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeAgent => "before_agent",
            HookPoint::AfterAgent => "after_agent",
            HookPoint::BeforeTool => "before_tool",
            HookPoint::AfterTool => "after_tool",
            HookPoint::BeforeModel => "before_model",
            HookPoint::AfterModel => "after_model",
        }
    }
}

/// Payload handed to a callback.
pub struct CallbackEvent<'a> {
    pub hook: HookPoint,
    /// Name of the agent the hook fired for.
    pub agent: &'a str,
    /// Hook-specific details (tool name, usage counters, …).
    pub detail: Value,
}

/// An observational hook. Callbacks return nothing and must not panic.
pub type Callback = Arc<dyn Fn(&CallbackEvent<'_>) + Send + Sync>;

/// A callable backing a code agent.
#[derive(Clone)]
pub enum CodeFunction {
    /// Synchronous callable, executed on the blocking pool.
    Sync(Arc<dyn Fn(HashMap<String, Value>) -> Result<Value, String> + Send + Sync>),
    /// Asynchronous callable, awaited in place.
    Async(
        Arc<
            dyn Fn(HashMap<String, Value>) -> BoxFuture<'static, Result<Value, String>>
                + Send
                + Sync,
        >,
    ),
}

impl CodeFunction {
    /// Invoke with state slots as keyword-style arguments. Sync callables
    /// never block the scheduler.
    pub async fn call(&self, args: HashMap<String, Value>) -> Result<Value, String> {
        match self {
            CodeFunction::Sync(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| format!("code function panicked: {}", e))?
            }
            CodeFunction::Async(f) => f(args).await,
        }
    }
}

/// Registration failures.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// Registration after boot completed.
    Frozen(&'static str),
    /// Empty registration name.
    EmptyName(&'static str),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Frozen(which) => {
                write!(f, "{} registry is frozen; registrations happen at boot", which)
            }
            RegistryError::EmptyName(which) => {
                write!(f, "{} registration requires a non-empty name", which)
            }
        }
    }
}

impl Error for RegistryError {}

struct Registry<T> {
    entries: HashMap<String, T>,
    frozen: bool,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            frozen: false,
        }
    }
}

lazy_static! {
    static ref CALLBACKS: RwLock<Registry<Callback>> = RwLock::new(Registry::new());
    static ref FUNCTIONS: RwLock<Registry<CodeFunction>> = RwLock::new(Registry::new());
}

/// Register a named callback. Boot-time only.
pub fn register_callback(name: &str, callback: Callback) -> Result<(), RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::EmptyName("callback"));
    }
    let mut guard = CALLBACKS.write().unwrap_or_else(|e| e.into_inner());
    if guard.frozen {
        return Err(RegistryError::Frozen("callback"));
    }
    guard.entries.insert(name.to_string(), callback);
    Ok(())
}

/// Look up a callback by name.
pub fn lookup_callback(name: &str) -> Option<Callback> {
    CALLBACKS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .entries
        .get(name)
        .cloned()
}

/// Register a named code function. Boot-time only.
pub fn register_function(path: &str, function: CodeFunction) -> Result<(), RegistryError> {
    if path.trim().is_empty() {
        return Err(RegistryError::EmptyName("function"));
    }
    let mut guard = FUNCTIONS.write().unwrap_or_else(|e| e.into_inner());
    if guard.frozen {
        return Err(RegistryError::Frozen("function"));
    }
    guard.entries.insert(path.to_string(), function);
    Ok(())
}

/// Look up a code function by its registered path.
pub fn lookup_function(path: &str) -> Option<CodeFunction> {
    FUNCTIONS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .entries
        .get(path)
        .cloned()
}

/// Freeze both registries. Called once when boot completes.
pub fn freeze() {
    CALLBACKS.write().unwrap_or_else(|e| e.into_inner()).frozen = true;
    FUNCTIONS.write().unwrap_or_else(|e| e.into_inner()).frozen = true;
}

/// A hydration-time view of the callbacks one agent declared, resolved
/// by name. Stored on the hydrated agent and fired by the executors.
#[derive(Clone, Default)]
pub struct ResolvedCallbacks {
    hooks: Vec<(HookPoint, Callback)>,
}

impl ResolvedCallbacks {
    pub fn new(hooks: Vec<(HookPoint, Callback)>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Fire every callback registered for `hook`.
    pub fn fire(&self, hook: HookPoint, agent: &str, detail: Value) {
        for (point, callback) in &self.hooks {
            if *point == hook {
                callback(&CallbackEvent {
                    hook,
                    agent,
                    detail: detail.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hook_points_parse_round_trip() {
        for name in [
            "before_agent",
            "after_agent",
            "before_tool",
            "after_tool",
            "before_model",
            "after_model",
        ] {
            let hook = HookPoint::parse(name).unwrap();
            assert_eq!(hook.as_str(), name);
        }
        assert!(HookPoint::parse("on_teardown").is_none());
    }

    #[test]
    fn callback_registration_and_lookup() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        register_callback(
            "test_counting_hook",
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let callback = lookup_callback("test_counting_hook").unwrap();
        callback(&CallbackEvent {
            hook: HookPoint::BeforeAgent,
            agent: "a",
            detail: json!({}),
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(lookup_callback("not_registered").is_none());
    }

    #[tokio::test]
    async fn sync_function_runs_off_the_scheduler() {
        register_function(
            "tests.double",
            CodeFunction::Sync(Arc::new(|args| {
                let n = args.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!(n * 2))
            })),
        )
        .unwrap();

        let f = lookup_function("tests.double").unwrap();
        let mut args = HashMap::new();
        args.insert("n".to_string(), json!(21));
        assert_eq!(f.call(args).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn async_function_is_awaited() {
        register_function(
            "tests.echo_async",
            CodeFunction::Async(Arc::new(|args| {
                Box::pin(async move { Ok(json!({ "args": args.len() })) })
            })),
        )
        .unwrap();

        let f = lookup_function("tests.echo_async").unwrap();
        assert_eq!(f.call(HashMap::new()).await.unwrap(), json!({"args": 0}));
    }

    #[test]
    fn empty_names_are_rejected() {
        assert!(matches!(
            register_callback("  ", Arc::new(|_| {})),
            Err(RegistryError::EmptyName(_))
        ));
    }
}
