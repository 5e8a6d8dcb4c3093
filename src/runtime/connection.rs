//! Per-context connection ownership: one connection per namespace, acquired
//! lazily and torn down exactly once per scenario.

use serde_json::Value;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::{Config, Connection, Transport, VolleyResult, VuContext, template};

#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<Config>) -> Self {
        Self { transport, config }
    }

    /// Reuse the context's connection for `namespace`, or open one and wait
    /// for it to report connected. Connections are exclusive to the owning
    /// context and never shared across virtual users.
    pub async fn acquire(
        &self,
        namespace: &str,
        ctx: &mut VuContext,
    ) -> VolleyResult<Arc<dyn Connection>> {
        if let Some(existing) = ctx.sockets.get(namespace) {
            return Ok(existing.clone());
        }

        let target = self.config.require_target()?;
        let options = self.connect_options(ctx);
        let conn = self.transport.connect(&target, namespace, &options).await?;

        let counter = ctx.message_counter();
        conn.on_any(Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        ctx.sockets.insert(namespace.to_string(), conn.clone());
        tracing::debug!(uid = ctx.uid, %namespace, "connection opened");
        Ok(conn)
    }

    /// Transport options are templated per context, then TLS options are
    /// merged on top.
    fn connect_options(&self, ctx: &VuContext) -> Value {
        let mut merged = serde_json::Map::new();
        if let Some(transport_opts) = &self.config.transport
            && let Value::Object(map) = template(transport_opts, ctx)
        {
            merged.extend(map);
        }
        if let Some(Value::Object(tls)) = self.config.tls.as_ref() {
            merged.extend(tls.clone());
        }
        Value::Object(merged)
    }

    /// Close every connection owned by the context. Idempotent; the second
    /// call sees an empty map.
    pub async fn release_all(&self, ctx: &mut VuContext) {
        for (namespace, conn) in std::mem::take(&mut ctx.sockets) {
            conn.close().await;
            tracing::debug!(uid = ctx.uid, %namespace, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimBehavior, SimTransport};
    use serde_json::json;

    fn manager() -> ConnectionManager {
        let config = Config {
            target: Some("wss://t".to_string()),
            ..Config::default()
        };
        ConnectionManager::new(
            Arc::new(SimTransport::new(SimBehavior::default())),
            Arc::new(config),
        )
    }

    #[tokio::test]
    async fn acquire_reuses_the_namespace_connection() {
        let mgr = manager();
        let mut ctx = VuContext::new(0, 7);
        let first = mgr.acquire("/", &mut ctx).await.unwrap();
        let second = mgr.acquire("/", &mut ctx).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.sockets.len(), 1);

        let other = mgr.acquire("/chat", &mut ctx).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(ctx.sockets.len(), 2);
    }

    #[tokio::test]
    async fn contexts_never_share_connections() {
        let mgr = manager();
        let mut a = VuContext::new(0, 7);
        let mut b = VuContext::new(1, 7);
        let ca = mgr.acquire("/", &mut a).await.unwrap();
        let cb = mgr.acquire("/", &mut b).await.unwrap();
        assert!(!Arc::ptr_eq(&ca, &cb));
    }

    #[tokio::test]
    async fn release_all_is_idempotent() {
        let mgr = manager();
        let mut ctx = VuContext::new(0, 7);
        mgr.acquire("/", &mut ctx).await.unwrap();
        mgr.acquire("/chat", &mut ctx).await.unwrap();
        mgr.release_all(&mut ctx).await;
        assert!(ctx.sockets.is_empty());
        mgr.release_all(&mut ctx).await;
        assert!(ctx.sockets.is_empty());
    }

    #[tokio::test]
    async fn transport_options_are_templated_per_context() {
        let config = Config {
            target: Some("wss://t".to_string()),
            transport: Some(json!({"auth": "{{ token }}"})),
            tls: Some(json!({"reject_unauthorized": false})),
            ..Config::default()
        };
        let mgr = ConnectionManager::new(
            Arc::new(SimTransport::new(SimBehavior::default())),
            Arc::new(config),
        );
        let mut ctx = VuContext::new(0, 7);
        ctx.vars.insert("token".to_string(), json!("secret"));
        let options = mgr.connect_options(&ctx);
        assert_eq!(
            options,
            json!({"auth": "secret", "reject_unauthorized": false})
        );
    }
}
