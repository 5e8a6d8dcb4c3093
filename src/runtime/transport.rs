//! Transport boundary: connection traits and the scripted in-process backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::{VolleyError, VolleyResult};

/// Settles an acknowledgment with the full callback-argument sequence. Fires
/// at most once; a dropped receiver makes the settlement a no-op.
pub type AckSender = oneshot::Sender<Vec<Value>>;

/// One-shot listener for the next payload on a named channel.
pub type ChannelListener = oneshot::Receiver<Value>;

/// Catch-all hook invoked for every inbound channel payload.
pub type AnyHook = Box<dyn Fn() + Send + Sync>;

/// A live connection to one namespace of the target.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Dispatch `event` with a positional argument list. When `ack` is
    /// supplied, the remote peer settles it with its callback arguments.
    async fn emit(&self, event: &str, args: Vec<Value>, ack: Option<AckSender>)
    -> VolleyResult<()>;

    /// Register a one-shot listener for `channel`. The registration is
    /// consumed by the first delivery; dropping the receiver discards any
    /// later payload.
    fn listen_once(&self, channel: &str) -> ChannelListener;

    fn on_any(&self, hook: AnyHook);

    async fn close(&self);
}

/// Opens connections against `target` + namespace. The wire protocol behind
/// this trait is not volley's concern; a real client implements it, the
/// scripted backend below simulates it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        target: &str,
        namespace: &str,
        options: &Value,
    ) -> VolleyResult<Arc<dyn Connection>>;
}

/// Scripted remote-peer behavior for the sim backend, declared in the
/// scenario file's `sim` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SimBehavior {
    #[serde(default)]
    pub rules: Vec<SimRule>,
    /// Namespaces that refuse to connect.
    #[serde(default)]
    pub connect_errors: Vec<String>,
}

/// How the scripted peer answers one event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SimRule {
    pub event: String,
    /// Callback arguments for the acknowledgment, if the peer acknowledges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Vec<Value>>,
    #[serde(default)]
    pub ack_delay_ms: u64,
    /// Out-of-band channel emissions triggered by this event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<SimEmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SimEmission {
    pub channel: String,
    pub data: Value,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Default)]
pub struct SimTransport {
    behavior: SimBehavior,
}

impl SimTransport {
    pub fn new(behavior: SimBehavior) -> Self {
        Self { behavior }
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(
        &self,
        target: &str,
        namespace: &str,
        _options: &Value,
    ) -> VolleyResult<Arc<dyn Connection>> {
        if self.behavior.connect_errors.iter().any(|ns| ns == namespace) {
            return Err(VolleyError::Connection(format!(
                "connect_error for {target}{namespace}"
            )));
        }
        Ok(Arc::new(SimConnection {
            namespace: namespace.to_string(),
            behavior: self.behavior.clone(),
            state: Arc::new(Mutex::new(SimConnState::default())),
        }))
    }
}

#[derive(Default)]
struct SimConnState {
    listeners: BTreeMap<String, Vec<oneshot::Sender<Value>>>,
    any_hooks: Vec<AnyHook>,
    closed: bool,
}

pub struct SimConnection {
    namespace: String,
    behavior: SimBehavior,
    state: Arc<Mutex<SimConnState>>,
}

impl SimConnection {
    fn deliver(state: &Arc<Mutex<SimConnState>>, channel: &str, data: Value) {
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.closed {
            return;
        }
        for hook in &st.any_hooks {
            hook();
        }
        if let Some(waiters) = st.listeners.get_mut(channel)
            && !waiters.is_empty()
        {
            let tx = waiters.remove(0);
            // a dropped receiver (e.g. after a timeout) suppresses the payload
            let _ = tx.send(data);
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    async fn emit(
        &self,
        event: &str,
        args: Vec<Value>,
        ack: Option<AckSender>,
    ) -> VolleyResult<()> {
        {
            let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if st.closed {
                return Err(VolleyError::InvalidDispatch(format!(
                    "connection to {} is closed",
                    self.namespace
                )));
            }
        }
        tracing::debug!(namespace = %self.namespace, %event, args = args.len(), "emit");

        let rule = self.behavior.rules.iter().find(|r| r.event == event);
        if let Some(rule) = rule {
            if let (Some(ack_tx), Some(ack_args)) = (ack, rule.ack.clone()) {
                let delay = Duration::from_millis(rule.ack_delay_ms);
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = ack_tx.send(ack_args);
                });
            }
            for emission in rule.emits.clone() {
                let state = self.state.clone();
                tokio::spawn(async move {
                    if emission.delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(emission.delay_ms)).await;
                    }
                    Self::deliver(&state, &emission.channel, emission.data);
                });
            }
        }
        Ok(())
    }

    fn listen_once(&self, channel: &str) -> ChannelListener {
        let (tx, rx) = oneshot::channel();
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !st.closed {
            st.listeners.entry(channel.to_string()).or_default().push(tx);
        }
        rx
    }

    fn on_any(&self, hook: AnyHook) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.any_hooks.push(hook);
    }

    async fn close(&self) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.closed = true;
        st.listeners.clear();
        st.any_hooks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scripted(rules: Vec<SimRule>) -> SimTransport {
        SimTransport::new(SimBehavior {
            rules,
            connect_errors: Vec::new(),
        })
    }

    #[tokio::test]
    async fn scripted_ack_settles_the_sender() {
        let transport = scripted(vec![SimRule {
            event: "user::create".to_string(),
            ack: Some(vec![json!(null), json!({"_id": "u1"})]),
            ack_delay_ms: 0,
            emits: Vec::new(),
        }]);
        let conn = transport.connect("wss://t", "/", &json!({})).await.unwrap();
        let (tx, rx) = oneshot::channel();
        conn.emit("user::create", vec![json!({})], Some(tx))
            .await
            .unwrap();
        let args = rx.await.unwrap();
        assert_eq!(args, vec![json!(null), json!({"_id": "u1"})]);
    }

    #[tokio::test]
    async fn emissions_reach_a_listener_and_the_catchall() {
        let transport = scripted(vec![SimRule {
            event: "ping".to_string(),
            ack: None,
            ack_delay_ms: 0,
            emits: vec![SimEmission {
                channel: "pong".to_string(),
                data: json!({"n": 1}),
                delay_ms: 0,
            }],
        }]);
        let conn = transport.connect("wss://t", "/", &json!({})).await.unwrap();
        let seen = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let counter = seen.clone();
        conn.on_any(Box::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
        let listener = conn.listen_once("pong");
        conn.emit("ping", Vec::new(), None).await.unwrap();
        let payload = listener.await.unwrap();
        assert_eq!(payload, json!({"n": 1}));
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn refused_namespaces_fail_to_connect() {
        let transport = SimTransport::new(SimBehavior {
            rules: Vec::new(),
            connect_errors: vec!["/admin".to_string()],
        });
        let err = match transport.connect("wss://t", "/admin", &json!({})).await {
            Ok(_) => panic!("connect must fail"),
            Err(e) => e,
        };
        assert!(matches!(err, VolleyError::Connection(_)));
        assert!(transport.connect("wss://t", "/", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn closed_connections_refuse_dispatch() {
        let transport = scripted(Vec::new());
        let conn = transport.connect("wss://t", "/", &json!({})).await.unwrap();
        conn.close().await;
        let err = conn.emit("x", Vec::new(), None).await.unwrap_err();
        assert!(matches!(err, VolleyError::InvalidDispatch(_)));
    }
}
