//! Handlers every unit installs before its application handlers.

use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use unitwire::Role;
use unitwire::actions;

use crate::config::ConfigStore;
use crate::dispatch::Handler;
use crate::dispatch::HandlerTable;
use crate::dispatch::Incoming;
use crate::registry::ConnectionId;
use crate::registry::ConnectionRegistry;
use crate::router::Route;
use crate::unit::UnitEvent;

/// Answers with the original envelope in its wire shape.
pub struct Ping;

#[async_trait::async_trait]
impl Handler for Ping {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(incoming.envelope().to_wire())?)
    }
}

/// Merges the payload into the unit's config store.
pub struct RegisterConfig {
    pub store: Arc<ConfigStore>,
}

#[async_trait::async_trait]
impl Handler for RegisterConfig {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value> {
        self.store.merge(incoming.into_envelope().into_data())?;
        Ok(Value::Null)
    }
}

/// Connection side of the hub handshake: remembers the id the hub assigned and
/// reports which application this unit belongs to.
pub struct Handshake {
    pub application: Option<String>,
    pub assigned: Arc<OnceLock<ConnectionId>>,
}

#[async_trait::async_trait]
impl Handler for Handshake {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value> {
        let id = incoming
            .data()
            .get("connectionId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("handshake without connectionId"))?;
        let id: ConnectionId = id.parse().context("handshake carried a bad connectionId")?;

        if self.assigned.set(id).is_err() {
            debug!(connection = %id, "repeated handshake ignored");
        }
        Ok(json!({ "application": self.application }))
    }
}

/// Accepts a lifecycle notification that needs no answer beyond an empty reply.
///
/// Applications that care about the notification bind their own handler in its place.
pub struct Notice;

#[async_trait::async_trait]
impl Handler for Notice {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value> {
        let envelope = incoming.envelope();
        debug!(
            action = envelope.action().unwrap_or_default(),
            source = %envelope.source(),
            data = %envelope.data(),
            "notification received"
        );
        Ok(Value::Null)
    }
}

/// Hub side of explicit registration: binds the sender's connection.
pub struct RegisterApplication {
    pub role: Role,
    pub peer_role: Role,
    pub registry: Arc<ConnectionRegistry>,
    pub events: broadcast::Sender<UnitEvent>,
}

#[async_trait::async_trait]
impl Handler for RegisterApplication {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value> {
        let Route::Connection(id) = *incoming.origin() else {
            bail!("registerApplication must arrive over a hub connection");
        };
        let name = incoming
            .data()
            .get("application")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("registerApplication without application name"))?
            .to_string();

        bind_and_announce(&self.registry, &self.events, (self.role, self.peer_role), id, &name).await?;
        Ok(json!({ "connectionId": id.to_string() }))
    }
}

/// Binds `name` to `id`, tells the other applications and emits the event.
pub(crate) async fn bind_and_announce(
    registry: &ConnectionRegistry,
    events: &broadcast::Sender<UnitEvent>,
    (role, peer_role): (Role, Role),
    id: ConnectionId,
    name: &str,
) -> anyhow::Result<()> {
    registry.bind_application(id, name)?;
    info!(connection = %id, application = name, "application registered");

    let notified = registry.broadcast_to_peers(name, role, peer_role).await;
    debug!(application = name, notified, "peers told about new application");

    let _ = events.send(UnitEvent::ApplicationRegistered {
        connection: id,
        application: name.to_string(),
    });
    Ok(())
}

/// Installs the built-in actions into `table`.
pub(crate) fn install(
    table: &mut HandlerTable,
    (role, peer_role): (Role, Role),
    hub: Option<Arc<ConnectionRegistry>>,
    store: Arc<ConfigStore>,
    application: Option<String>,
    assigned: Arc<OnceLock<ConnectionId>>,
    events: broadcast::Sender<UnitEvent>,
) {
    table.insert(actions::PING, Arc::new(Ping));
    table.insert(actions::REGISTER_CONFIG, Arc::new(RegisterConfig { store }));
    table.insert(actions::HANDSHAKE, Arc::new(Handshake { application, assigned }));
    for notice in [actions::CONSTRUCTED, actions::CONNECTION_READY, actions::PEER_CONNECTED] {
        table.insert(notice, Arc::new(Notice));
    }

    if let Some(registry) = hub {
        table.insert(
            actions::REGISTER_APPLICATION,
            Arc::new(RegisterApplication { role, peer_role, registry, events }),
        );
    }
}
