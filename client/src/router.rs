//! Dispatch of Spyder messages to registered handlers.
//!
//! A Spyder message is an IOPub message whose content carries a
//! `spyder_msg_type`, either at the top level or, for comm messages, under
//! `content.data`. Everything else is ignored.
//!
//! Handlers are bound per [`MessageKind`] in two scopes: process-wide and
//! per shell. Lookup tries the shell's binding first. Registration hands out
//! a [`HandlerToken`]; owners keep tokens, never handles into the router.
//!
//! [`MessageRouter::deliver`] never fails: a missing handler is logged at
//! debug level, a handler error or panic is logged and contained. Calls for
//! one shell run in the order they are made.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use spyder_remote_protocol::wire::JupyterMessage;
use spyder_remote_protocol::ErrorKind;
use tracing::{debug, warn};

/// The message kinds the IDE itself understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownKind {
    RemoteCall,
    RemoteCallReply,
    PdbState,
    PdbInput,
    SetBreakpoints,
    ShowPdbOutput,
}

impl KnownKind {
    pub const ALL: [KnownKind; 6] = [
        KnownKind::RemoteCall,
        KnownKind::RemoteCallReply,
        KnownKind::PdbState,
        KnownKind::PdbInput,
        KnownKind::SetBreakpoints,
        KnownKind::ShowPdbOutput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteCall => "remote_call",
            Self::RemoteCallReply => "remote_call_reply",
            Self::PdbState => "pdb_state",
            Self::PdbInput => "pdb_input",
            Self::SetBreakpoints => "set_breakpoints",
            Self::ShowPdbOutput => "show_pdb_output",
        }
    }
}

/// A `spyder_msg_type`: one of the known kinds or a plugin-defined one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Known(KnownKind),
    Other(String),
}

impl MessageKind {
    pub fn parse(s: &str) -> Self {
        KnownKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .map_or_else(|| Self::Other(s.to_string()), Self::Known)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(k) => k.as_str(),
            Self::Other(s) => s,
        }
    }
}

impl From<KnownKind> for MessageKind {
    fn from(k: KnownKind) -> Self {
        Self::Known(k)
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct SpyderMessage {
    pub kind: MessageKind,
    /// The envelope's `content` field (`null` when absent).
    pub content: Value,
    /// Comm id for messages that arrived as `comm_msg`.
    pub comm_id: Option<String>,
    pub msg_id: String,
    pub buffers: Vec<Vec<u8>>,
}

impl SpyderMessage {
    /// Extract the envelope, or `None` for ordinary kernel messages.
    pub fn from_jupyter(msg: &JupyterMessage) -> Option<Self> {
        let content = &msg.content;
        let envelope = if content.get("spyder_msg_type").is_some() {
            content
        } else {
            content.get("data").filter(|d| d.get("spyder_msg_type").is_some())?
        };
        let kind = envelope["spyder_msg_type"].as_str()?;
        Some(Self {
            kind: MessageKind::parse(kind),
            content: envelope.get("content").cloned().unwrap_or(Value::Null),
            comm_id: content["comm_id"].as_str().map(String::from),
            msg_id: msg.header.msg_id.clone(),
            buffers: msg.buffers.clone(),
        })
    }
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&SpyderMessage) -> HandlerResult + Send + Sync>;

/// Opaque id of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

/// What [`MessageRouter::deliver`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Not a Spyder message.
    Ignored,
    /// No handler bound for the kind.
    Unrouted(MessageKind),
    Handled,
    /// The handler returned an error or panicked.
    Failed(String),
}

impl Delivery {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        matches!(self, Self::Failed(_)).then_some(ErrorKind::HandlerError)
    }
}

struct Binding {
    token: HandlerToken,
    handler: Handler,
}

#[derive(Clone, PartialEq, Eq)]
enum Scope {
    Global(MessageKind),
    Local(String, MessageKind),
}

#[derive(Default)]
struct Tables {
    global: HashMap<MessageKind, Binding>,
    local: HashMap<String, HashMap<MessageKind, Binding>>,
    scopes: HashMap<HandlerToken, Scope>,
}

impl Tables {
    fn insert(&mut self, scope: Scope, binding: Binding) {
        self.scopes.insert(binding.token, scope.clone());
        let replaced = match scope {
            Scope::Global(kind) => self.global.insert(kind, binding),
            Scope::Local(shell, kind) => self.local.entry(shell).or_default().insert(kind, binding),
        };
        if let Some(old) = replaced {
            self.scopes.remove(&old.token);
        }
    }
}

/// Handler tables behind a read-mostly lock. Cheap to clone.
#[derive(Clone, Default)]
pub struct MessageRouter {
    tables: Arc<RwLock<Tables>>,
    next_token: Arc<AtomicU64>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind` for every shell, replacing any previous
    /// global binding of that kind.
    pub fn register_global<F>(&self, kind: impl Into<MessageKind>, handler: F) -> HandlerToken
    where
        F: Fn(&SpyderMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!("Registering global handler for {kind}");
        self.insert(Scope::Global(kind), Arc::new(handler))
    }

    /// Bind `handler` to `kind` for one shell, shadowing the global one.
    pub fn register_local<F>(
        &self,
        shell_id: &str,
        kind: impl Into<MessageKind>,
        handler: F,
    ) -> HandlerToken
    where
        F: Fn(&SpyderMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!("Registering handler for {kind} on shell {shell_id}");
        self.insert(Scope::Local(shell_id.to_string(), kind), Arc::new(handler))
    }

    fn insert(&self, scope: Scope, handler: Handler) -> HandlerToken {
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.write().insert(scope, Binding { token, handler });
        token
    }

    /// Remove a registration. Unknown or stale tokens are ignored.
    pub fn unregister(&self, token: HandlerToken) {
        let mut tables = self.write();
        let Some(scope) = tables.scopes.remove(&token) else {
            return;
        };
        match scope {
            Scope::Global(kind) => {
                tables.global.remove(&kind);
            }
            Scope::Local(shell, kind) => {
                if let Some(bindings) = tables.local.get_mut(&shell) {
                    bindings.remove(&kind);
                    if bindings.is_empty() {
                        tables.local.remove(&shell);
                    }
                }
            }
        }
    }

    /// Drop every per-shell binding of `shell_id`.
    pub fn remove_shell(&self, shell_id: &str) {
        let mut tables = self.write();
        if let Some(bindings) = tables.local.remove(shell_id) {
            for binding in bindings.values() {
                tables.scopes.remove(&binding.token);
            }
        }
    }

    /// Route one kernel message from `shell_id` to its handler.
    pub fn deliver(&self, shell_id: &str, msg: &JupyterMessage) -> Delivery {
        match SpyderMessage::from_jupyter(msg) {
            Some(message) => self.dispatch(shell_id, &message),
            None => Delivery::Ignored,
        }
    }

    /// Route an already extracted envelope.
    pub fn dispatch(&self, shell_id: &str, message: &SpyderMessage) -> Delivery {
        let Some(handler) = self.lookup(shell_id, &message.kind) else {
            debug!("No handler for Spyder message {} on shell {shell_id}", message.kind);
            return Delivery::Unrouted(message.kind.clone());
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message)));
        match outcome {
            Ok(Ok(())) => Delivery::Handled,
            Ok(Err(e)) => {
                warn!("HandlerError: {} handler on shell {shell_id} failed: {e}", message.kind);
                Delivery::Failed(e.to_string())
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                warn!("HandlerError: {} handler on shell {shell_id} panicked: {reason}", message.kind);
                Delivery::Failed(reason)
            }
        }
    }

    fn lookup(&self, shell_id: &str, kind: &MessageKind) -> Option<Handler> {
        let tables = self.read();
        tables
            .local
            .get(shell_id)
            .and_then(|bindings| bindings.get(kind))
            .or_else(|| tables.global.get(kind))
            .map(|b| Arc::clone(&b.handler))
    }

    // Handlers never run under the lock.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn spyder_msg(kind: &str, content: Value) -> JupyterMessage {
        JupyterMessage::new(
            "comm_msg",
            "session",
            json!({
                "comm_id": "c1",
                "data": {"spyder_msg_type": kind, "content": content},
            }),
        )
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(
        log: &Log,
        tag: &'static str,
    ) -> impl Fn(&SpyderMessage) -> HandlerResult + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |m: &SpyderMessage| {
            log.lock().unwrap().push(format!("{tag}:{}", m.content));
            Ok(())
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(MessageKind::parse("pdb_state"), MessageKind::Known(KnownKind::PdbState));
        assert_eq!(
            MessageKind::parse("my_plugin_msg"),
            MessageKind::Other("my_plugin_msg".into())
        );
        for k in KnownKind::ALL {
            assert_eq!(MessageKind::parse(k.as_str()), MessageKind::Known(k));
        }
    }

    #[test]
    fn test_envelope_forms() {
        let comm = spyder_msg("remote_call", json!({"call_name": "f"}));
        let m = SpyderMessage::from_jupyter(&comm).unwrap();
        assert_eq!(m.kind, MessageKind::Known(KnownKind::RemoteCall));
        assert_eq!(m.content, json!({"call_name": "f"}));
        assert_eq!(m.comm_id.as_deref(), Some("c1"));

        let flat = JupyterMessage::new(
            "display_data",
            "s",
            json!({"spyder_msg_type": "show_pdb_output", "content": "out"}),
        );
        let m = SpyderMessage::from_jupyter(&flat).unwrap();
        assert_eq!(m.kind, MessageKind::Known(KnownKind::ShowPdbOutput));
        assert_eq!(m.comm_id, None);

        let status = JupyterMessage::new("status", "s", json!({"execution_state": "idle"}));
        assert_eq!(SpyderMessage::from_jupyter(&status), None);
    }

    #[test]
    fn test_local_shadows_global() {
        let router = MessageRouter::new();
        let log: Log = Arc::default();
        router.register_global(KnownKind::PdbState, recorder(&log, "global"));
        router.register_local("s1", KnownKind::PdbState, recorder(&log, "s1"));

        assert_eq!(router.deliver("s1", &spyder_msg("pdb_state", json!(1))), Delivery::Handled);
        assert_eq!(router.deliver("s2", &spyder_msg("pdb_state", json!(2))), Delivery::Handled);
        assert_eq!(
            router.deliver("s1", &spyder_msg("set_breakpoints", json!(3))),
            Delivery::Unrouted(MessageKind::Known(KnownKind::SetBreakpoints))
        );
        assert_eq!(*log.lock().unwrap(), ["s1:1", "global:2"]);
    }

    #[test]
    fn test_non_spyder_messages_are_ignored() {
        let router = MessageRouter::new();
        let msg = JupyterMessage::new("stream", "s", json!({"name": "stdout", "text": "hi"}));
        assert_eq!(router.deliver("s1", &msg), Delivery::Ignored);
    }

    #[test]
    fn test_unregister_is_idempotent_and_final() {
        let router = MessageRouter::new();
        let log: Log = Arc::default();
        let global = router.register_global("custom_kind", recorder(&log, "g"));
        let local = router.register_local("s1", "custom_kind", recorder(&log, "l"));

        router.unregister(local);
        router.unregister(local);
        router.deliver("s1", &spyder_msg("custom_kind", json!(1)));
        router.unregister(global);
        let d = router.deliver("s1", &spyder_msg("custom_kind", json!(2)));
        assert_eq!(d, Delivery::Unrouted(MessageKind::Other("custom_kind".into())));
        assert_eq!(*log.lock().unwrap(), ["g:1"]);
    }

    #[test]
    fn test_reregistration_replaces_and_retires_old_token() {
        let router = MessageRouter::new();
        let log: Log = Arc::default();
        let first = router.register_global(KnownKind::PdbInput, recorder(&log, "first"));
        let second = router.register_global(KnownKind::PdbInput, recorder(&log, "second"));
        assert_ne!(first, second);

        // The retired token must not remove the live binding.
        router.unregister(first);
        router.deliver("s", &spyder_msg("pdb_input", json!(0)));
        assert_eq!(*log.lock().unwrap(), ["second:0"]);
    }

    #[test]
    fn test_handler_failures_are_contained() {
        let router = MessageRouter::new();
        router.register_global(KnownKind::RemoteCall, |_| Err("boom".into()));
        router.register_global(KnownKind::RemoteCallReply, |_| panic!("handler exploded"));

        let d = router.deliver("s", &spyder_msg("remote_call", json!({})));
        assert_eq!(d, Delivery::Failed("boom".into()));
        assert_eq!(d.error_kind(), Some(ErrorKind::HandlerError));

        let d = router.deliver("s", &spyder_msg("remote_call_reply", json!({})));
        assert_eq!(d, Delivery::Failed("handler exploded".into()));

        // The router keeps working afterwards.
        let log: Log = Arc::default();
        router.register_global(KnownKind::RemoteCall, recorder(&log, "ok"));
        assert_eq!(router.deliver("s", &spyder_msg("remote_call", json!(5))), Delivery::Handled);
    }

    #[test]
    fn test_per_shell_order_across_threads() {
        let router = MessageRouter::new();
        let log: Log = Arc::default();
        router.register_global(KnownKind::ShowPdbOutput, recorder(&log, "x"));

        let workers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|shell| {
                let router = router.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        router.deliver(shell, &spyder_msg("show_pdb_output", json!(format!("{shell}{i}"))));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let log = log.lock().unwrap();
        for shell in ["a", "b"] {
            let seen: Vec<&String> = log.iter().filter(|e| e.starts_with(&format!("x:\"{shell}"))).collect();
            let expected: Vec<String> = (0..50).map(|i| format!("x:\"{shell}{i}\"")).collect();
            assert_eq!(seen, expected.iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_remove_shell_drops_local_bindings() {
        let router = MessageRouter::new();
        let log: Log = Arc::default();
        router.register_global(KnownKind::PdbState, recorder(&log, "g"));
        let token = router.register_local("s1", KnownKind::PdbState, recorder(&log, "l"));
        router.remove_shell("s1");
        router.unregister(token);
        router.deliver("s1", &spyder_msg("pdb_state", json!(1)));
        assert_eq!(*log.lock().unwrap(), ["g:1"]);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unrouted_kind_logs_one_debug_line() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let router = MessageRouter::new();
        let (unrouted, ignored) = tracing::subscriber::with_default(subscriber, || {
            let status = JupyterMessage::new("status", "s", json!({"execution_state": "idle"}));
            (
                router.deliver("s1", &spyder_msg("custom_kind", json!(1))),
                router.deliver("s1", &status),
            )
        });
        assert_eq!(unrouted, Delivery::Unrouted(MessageKind::Other("custom_kind".into())));
        assert_eq!(ignored, Delivery::Ignored);

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1, "{output}");
        assert!(lines[0].contains("DEBUG"), "{output}");
        assert!(
            lines[0].contains("No handler for Spyder message custom_kind on shell s1"),
            "{output}"
        );
    }
}
