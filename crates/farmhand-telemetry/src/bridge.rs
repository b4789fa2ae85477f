//! MQTT bridge that feeds smart plug telemetry into snapshot tables.
//!
//! The bridge owns one broker connection at a time. A background task
//! drives the event loop, reconnects after failures, and replays every
//! active topic subscription once the broker acknowledges a session.
//!
//! # Example
//!
//! ```ignore
//! use farmhand_telemetry::{BridgeSettings, PlugSubscription, SmartPlugBridge};
//!
//! let bridge = SmartPlugBridge::new();
//! let settings = BridgeSettings {
//!     enabled: true,
//!     broker: "10.0.0.5".into(),
//!     ..Default::default()
//! };
//! if bridge.configure(settings).await {
//!     bridge
//!         .subscribe(1, PlugSubscription::new("plugs/shed").with_power_path("power"))
//!         .await;
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::plug::{PlugSnapshot, PlugSubscription};
use crate::table::{PlugTable, TopicChange};

/// Broker connection settings, typically sourced from user configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Whether the bridge should connect at all.
    pub enabled: bool,
    /// Broker hostname or IP address.
    pub broker: String,
    /// Broker port.
    pub port: u16,
    /// Username, empty for anonymous access.
    pub username: String,
    /// Password, ignored when `username` is empty.
    pub password: String,
    /// Connect over TLS instead of plain TCP.
    pub use_tls: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            use_tls: false,
        }
    }
}

/// Tuning knobs for the bridge runtime.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// How long `configure` waits for the broker to accept the session.
    pub connect_timeout: Duration,
    /// Plugs without telemetry for this long count as unreachable.
    pub reachable_timeout: Duration,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Pause between reconnect attempts after a connection failure.
    pub reconnect_delay: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            reachable_timeout: Duration::from_secs(300),
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Connection lifecycle as observed by the event loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No broker session, and no attempt in flight.
    Disconnected,
    /// A connect or reconnect attempt is in flight.
    Connecting,
    /// The broker acknowledged the session.
    Connected,
}

struct BrokerLink {
    client: AsyncClient,
    settings: BridgeSettings,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Bridge between an MQTT broker and per-plug telemetry snapshots.
pub struct SmartPlugBridge {
    options: BridgeOptions,
    table: Arc<Mutex<PlugTable>>,
    link: tokio::sync::Mutex<Option<BrokerLink>>,
    applied: Mutex<Option<BridgeSettings>>,
    configured: AtomicBool,
    state: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SmartPlugBridge {
    /// Creates a bridge with default options.
    pub fn new() -> Self {
        Self::with_options(BridgeOptions::default())
    }

    /// Creates a bridge with explicit options.
    pub fn with_options(options: BridgeOptions) -> Self {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            table: Arc::new(Mutex::new(PlugTable::default())),
            link: tokio::sync::Mutex::new(None),
            applied: Mutex::new(None),
            configured: AtomicBool::new(false),
            state: Arc::new(state),
            state_rx,
        }
    }

    /// Applies broker settings and reports whether the bridge is usable.
    ///
    /// Disabling the bridge tears down any connection and succeeds. An
    /// enabled bridge without a broker host fails, leaving a previous
    /// session and its remembered settings alone. Otherwise the bridge
    /// connects (reusing an existing session when the settings did not
    /// change) and reports whether the broker accepted within the
    /// connect timeout. On a timeout the background task keeps retrying;
    /// a later `configure` with the same settings can still succeed.
    pub async fn configure(&self, settings: BridgeSettings) -> bool {
        if !settings.enabled {
            info!("smart plug bridge disabled");
            self.disconnect().await;
            self.configured.store(false, Ordering::SeqCst);
            return true;
        }
        if settings.broker.is_empty() {
            warn!("smart plug bridge enabled without a broker host");
            self.configured.store(false, Ordering::SeqCst);
            return false;
        }

        let mut link = self.link.lock().await;
        let changed = link
            .as_ref()
            .map(|l| l.settings != settings)
            .unwrap_or(false);
        if changed {
            info!("broker settings changed, reconnecting");
            if let Some(old) = link.take() {
                shutdown_link(old).await;
            }
        }
        *self.applied.lock() = Some(settings.clone());
        self.configured.store(true, Ordering::SeqCst);
        if link.is_none() {
            self.spawn_link(&mut link, settings);
        }
        drop(link);

        self.wait_connected().await
    }

    fn spawn_link(&self, slot: &mut Option<BrokerLink>, settings: BridgeSettings) {
        let client_id = format!("farmhand-plug-{}", uuid::Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, settings.broker.clone(), settings.port);
        mqtt_options.set_keep_alive(self.options.keep_alive);
        mqtt_options.set_clean_session(true);
        if !settings.username.is_empty() {
            mqtt_options.set_credentials(&settings.username, &settings.password);
        }
        if settings.use_tls {
            let tls_config = TlsConfiguration::Simple {
                ca: vec![], // Accept any certificate
                alpn: None,
                client_auth: None,
            };
            mqtt_options.set_transport(Transport::tls_with_config(tls_config));
        }

        info!(
            "connecting to MQTT broker {}:{}",
            settings.broker, settings.port
        );
        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);
        let cancel = CancellationToken::new();

        // Connecting must be visible before the task can report Connected.
        let _ = self.state.send(ConnectionState::Connecting);
        let task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&self.table),
            Arc::clone(&self.state),
            cancel.clone(),
            self.options.reconnect_delay,
        ));
        *slot = Some(BrokerLink {
            client,
            settings,
            cancel,
            task,
        });
    }

    async fn wait_connected(&self) -> bool {
        let mut rx = self.state_rx.clone();
        let wait = rx.wait_for(|state| *state == ConnectionState::Connected);
        // Bound to a local so the watch guard drops before `rx` does.
        let outcome = timeout(self.options.connect_timeout, wait).await;
        match outcome {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    "broker did not accept the connection within {:?}",
                    self.options.connect_timeout
                );
                false
            }
        }
    }

    /// Points a plug at a topic, replacing any previous subscription.
    pub async fn subscribe(&self, plug_id: i64, sub: PlugSubscription) {
        info!("plug {} follows topic {}", plug_id, sub.topic);
        let change = self.table.lock().subscribe(plug_id, sub);
        self.apply_topic_change(change).await;
    }

    /// Removes a plug's subscription and cached readings.
    pub async fn unsubscribe(&self, plug_id: i64) {
        let released = self.table.lock().unsubscribe(plug_id);
        if let Some(topic) = &released {
            debug!("plug {plug_id} released topic {topic}");
        }
        self.apply_topic_change(TopicChange {
            subscribe: None,
            unsubscribe: released,
        })
        .await;
    }

    /// Performs the broker calls implied by a table change, when connected.
    ///
    /// A disconnected bridge skips them; the reconnect path replays every
    /// active topic on ConnAck instead.
    async fn apply_topic_change(&self, change: TopicChange) {
        if change.is_empty() || self.connection_state() != ConnectionState::Connected {
            return;
        }
        let client = match self.link.lock().await.as_ref() {
            Some(link) => link.client.clone(),
            None => return,
        };
        if let Some(topic) = change.unsubscribe {
            match client.unsubscribe(&topic).await {
                Ok(()) => debug!("unsubscribed from {topic}"),
                Err(e) => error!("unsubscribe from {topic} failed: {e}"),
            }
        }
        if let Some(topic) = change.subscribe {
            match client.subscribe(&topic, QoS::AtLeastOnce).await {
                Ok(()) => debug!("subscribed to {topic}"),
                Err(e) => error!("subscribe to {topic} failed: {e}"),
            }
        }
    }

    /// Latest readings for a plug, if it is subscribed.
    pub fn snapshot(&self, plug_id: i64) -> Option<PlugSnapshot> {
        self.table.lock().snapshot(plug_id)
    }

    /// Whether the plug reported telemetry within the reachable window.
    pub fn is_reachable(&self, plug_id: i64) -> bool {
        self.table
            .lock()
            .is_reachable(plug_id, self.options.reachable_timeout)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether a broker host has been applied, connected or not.
    pub fn has_broker_settings(&self) -> bool {
        self.applied
            .lock()
            .as_ref()
            .map(|s| !s.broker.is_empty())
            .unwrap_or(false)
    }

    /// Whether the last `configure` took and the broker session is live.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
            && self.connection_state() == ConnectionState::Connected
    }

    /// Tears down the broker connection. Subscriptions and cached
    /// readings survive for the next connect.
    pub async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            info!("disconnecting from MQTT broker");
            shutdown_link(link).await;
        }
        let _ = self.state.send(ConnectionState::Disconnected);
    }
}

impl Default for SmartPlugBridge {
    fn default() -> Self {
        Self::new()
    }
}

async fn shutdown_link(link: BrokerLink) {
    link.cancel.cancel();
    if let Err(e) = link.task.await {
        debug!("MQTT task join failed: {e}");
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    table: Arc<Mutex<PlugTable>>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client.disconnect().await;
                let _ = state.send(ConnectionState::Disconnected);
                debug!("MQTT event loop stopped");
                return;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("MQTT broker accepted the connection");
                        let _ = state.send(ConnectionState::Connected);
                        resubscribe_all(&client, &table).await;
                    } else {
                        warn!("MQTT broker refused the connection: {:?}", ack.code);
                        let _ = state.send(ConnectionState::Disconnected);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&table, &publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT broker closed the session");
                    let _ = state.send(ConnectionState::Disconnected);
                }
                Ok(_) => {}
                Err(e) => {
                    if *state.borrow() == ConnectionState::Connected {
                        warn!("MQTT connection lost: {e}");
                    } else {
                        debug!("MQTT connect attempt failed: {e}");
                    }
                    let _ = state.send(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("MQTT event loop stopped");
                            return;
                        }
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    let _ = state.send(ConnectionState::Connecting);
                }
            }
        }
    }
}

/// Replays every active topic subscription after a (re)connect.
async fn resubscribe_all(client: &AsyncClient, table: &Arc<Mutex<PlugTable>>) {
    let topics = table.lock().topics();
    for topic in topics {
        match client.subscribe(&topic, QoS::AtLeastOnce).await {
            Ok(()) => debug!("resubscribed to {topic}"),
            Err(e) => error!("resubscribe to {topic} failed: {e}"),
        }
    }
}

fn handle_publish(table: &Arc<Mutex<PlugTable>>, topic: &str, payload: &[u8]) {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("dropping non-JSON payload on {topic}: {e}");
            return;
        }
    };
    let touched = table.lock().apply(topic, &value, Utc::now());
    if touched > 0 {
        debug!("telemetry on {topic} updated {touched} plug(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plug::PlugState;

    #[tokio::test]
    async fn test_configure_disabled_is_success() {
        let bridge = SmartPlugBridge::new();
        let settings = BridgeSettings {
            enabled: false,
            ..Default::default()
        };
        assert!(bridge.configure(settings).await);
        assert!(!bridge.has_broker_settings());
        assert!(!bridge.is_configured());
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_configure_without_host_fails() {
        let bridge = SmartPlugBridge::new();
        let settings = BridgeSettings {
            enabled: true,
            ..Default::default()
        };
        assert!(!bridge.configure(settings).await);
        assert!(!bridge.has_broker_settings());
    }

    #[tokio::test]
    async fn test_configure_times_out_against_dead_broker() {
        let bridge = SmartPlugBridge::with_options(BridgeOptions {
            connect_timeout: Duration::from_millis(300),
            ..Default::default()
        });
        let settings = BridgeSettings {
            enabled: true,
            broker: "127.0.0.1".into(),
            port: 59999,
            ..Default::default()
        };

        assert!(!bridge.configure(settings).await);
        assert!(bridge.has_broker_settings());
        assert!(!bridge.is_configured());

        bridge.disconnect().await;
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wait_connected_sees_state_flip() {
        let bridge = SmartPlugBridge::with_options(BridgeOptions {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        });
        let state = Arc::clone(&bridge.state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = state.send(ConnectionState::Connected);
        });

        assert!(bridge.wait_connected().await);
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_missing_host_leaves_previous_session_alone() {
        let bridge = SmartPlugBridge::with_options(BridgeOptions {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let settings = BridgeSettings {
            enabled: true,
            broker: "127.0.0.1".into(),
            port: 59998,
            ..Default::default()
        };
        // The broker is dead, so configure fails but leaves a retrying link.
        assert!(!bridge.configure(settings).await);
        assert!(bridge.link.lock().await.is_some());
        assert!(bridge.has_broker_settings());

        let no_host = BridgeSettings {
            enabled: true,
            ..Default::default()
        };
        assert!(!bridge.configure(no_host).await);

        // The earlier link and its remembered broker survive.
        assert!(bridge.link.lock().await.is_some());
        assert!(bridge.has_broker_settings());
        assert!(!bridge.is_configured());

        bridge.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_and_snapshot_without_broker() {
        let bridge = SmartPlugBridge::new();
        bridge
            .subscribe(
                7,
                PlugSubscription::new("plug/7")
                    .with_power_path("power")
                    .with_multiplier(10.0),
            )
            .await;

        let snapshot = bridge.snapshot(7).unwrap();
        assert!(snapshot.power.is_none());
        // Subscribing counts as seeing the plug.
        assert!(bridge.is_reachable(7));

        handle_publish(&bridge.table, "plug/7", br#"{"power": 2.5}"#);
        assert_eq!(bridge.snapshot(7).unwrap().power, Some(25.0));

        bridge.unsubscribe(7).await;
        assert!(bridge.snapshot(7).is_none());
        assert!(!bridge.is_reachable(7));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let bridge = SmartPlugBridge::new();
        bridge
            .subscribe(2, PlugSubscription::new("plug/2").with_state_path("state"))
            .await;

        handle_publish(&bridge.table, "plug/2", b"not json at all");
        assert!(bridge.snapshot(2).unwrap().state.is_none());

        handle_publish(&bridge.table, "plug/2", br#"{"state": "standby"}"#);
        assert_eq!(
            bridge.snapshot(2).unwrap().state,
            Some(PlugState::Other("STANDBY".into()))
        );
    }
}
