//! Peripheral lifecycle.
//!
//! The orchestrator drives a [`BusLink`] through the BlueZ registration
//! protocol: wait for the daemon, connect, export the object tree, then
//! register agent, application and advertisement in that order. Any step
//! can fail; failures roll the link back to a clean slate and the whole
//! bring-up is retried up to a configured bound. Losing the daemon while
//! running also rolls back and re-enters bring-up.
//!
//! [`BusLink`] exists so the state machine can be exercised without a
//! bus: tests script per-step failures and observe the exact transition
//! sequence.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use zbus::names::BusName;
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::{Connection, MessageStream};

use crate::config::PeripheralConfig;
use crate::error::Error;
use crate::infrastructure::bluetooth::advertising::{AdvertisementObj, SharedName};
use crate::infrastructure::bluetooth::agent::PairingAgent;
use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole};
use crate::infrastructure::bluetooth::proxies::{
    AdapterProxy, AgentManagerProxy, GattManagerProxy, LEAdvertisingManagerProxy,
};
use crate::infrastructure::bluetooth::{monitor, objects};
use crate::models::PeripheralEvent;
use crate::telemetry::TelemetrySink;

/// Where the peripheral currently stands. Published on a watch channel;
/// observers always see the latest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    WaitingForDaemon,
    BusConnected,
    ObjectsRegistered,
    ApplicationRegistered,
    AdvertisingRegistered,
    Running,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WaitingForDaemon => "waiting-for-daemon",
            Self::BusConnected => "bus-connected",
            Self::ObjectsRegistered => "objects-registered",
            Self::ApplicationRegistered => "application-registered",
            Self::AdvertisingRegistered => "advertising-registered",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Commands accepted by the running orchestrator.
#[derive(Debug)]
pub(crate) enum Command {
    /// Graceful teardown, then exit the dispatch loop.
    Stop,
    /// Push a payload to subscribers of a notify-capable characteristic.
    Notify {
        role: CharacteristicRole,
        payload: Vec<u8>,
    },
}

/// Outcome of one wait on the link while running.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LinkWatch {
    /// Something routine happened (or nothing of interest); keep serving.
    Handled,
    /// The daemon left the bus; the link must be rebuilt.
    DaemonLost,
}

/// One step-at-a-time connection to the daemon.
///
/// The orchestrator calls the registration steps strictly in declaration
/// order and calls [`BusLink::rollback`] after any failure, so an
/// implementation only has to undo what it actually did.
#[async_trait]
pub(crate) trait BusLink: Send {
    async fn daemon_available(&mut self) -> Result<bool, Error>;
    async fn connect(&mut self) -> Result<(), Error>;
    async fn subscribe_signals(&mut self) -> Result<(), Error>;
    async fn register_objects(&mut self) -> Result<(), Error>;
    async fn register_agent(&mut self) -> Result<(), Error>;
    async fn register_application(&mut self) -> Result<(), Error>;
    async fn register_advertisement(&mut self) -> Result<(), Error>;

    /// Wait for and handle the next piece of bus traffic.
    async fn watch(&mut self) -> LinkWatch;

    /// Emit a value notification for a characteristic.
    async fn emit_value(&mut self, role: CharacteristicRole, payload: &[u8]) -> Result<(), Error>;

    /// Undo every registration and drop the connection. Must be safe to
    /// call at any point, including after partial bring-up.
    async fn rollback(&mut self);

    /// Graceful teardown at the end of the peripheral's life.
    async fn shutdown(&mut self);
}

enum ServeExit {
    Stopped,
    DaemonLost,
}

pub(crate) struct Orchestrator<L: BusLink> {
    config: PeripheralConfig,
    link: L,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<LifecycleState>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl<L: BusLink> Orchestrator<L> {
    pub(crate) fn new(
        config: PeripheralConfig,
        link: L,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<LifecycleState>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            link,
            commands,
            state,
            telemetry,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if !self.discard_stale_notifies() {
                info!("stop requested before bring-up");
                self.link.shutdown().await;
                self.set_state(LifecycleState::Idle);
                return;
            }
            match self.bring_up().await {
                Ok(()) => {
                    attempts = 0;
                    match self.serve().await {
                        ServeExit::Stopped => {
                            info!("stop requested, tearing down");
                            self.link.shutdown().await;
                            self.set_state(LifecycleState::Idle);
                            return;
                        }
                        ServeExit::DaemonLost => {
                            warn!("bluetooth daemon left the bus, rebuilding");
                            self.telemetry.event("daemon_lost", "rebuilding link");
                            self.link.rollback().await;
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "unrecoverable bring-up failure");
                    self.telemetry.event("lifecycle_failed", &e.to_string());
                    self.link.rollback().await;
                    self.set_state(LifecycleState::Failed);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempts, "bring-up failed");
                    self.link.rollback().await;
                    if attempts >= self.config.max_attempts {
                        error!(
                            attempts,
                            "bring-up attempt bound reached, giving up"
                        );
                        self.telemetry.event("lifecycle_failed", &e.to_string());
                        self.set_state(LifecycleState::Failed);
                        return;
                    }
                    if !self.retry_pause().await {
                        info!("stop requested during retry pause");
                        self.link.shutdown().await;
                        self.set_state(LifecycleState::Idle);
                        return;
                    }
                }
            }
        }
    }

    async fn bring_up(&mut self) -> Result<(), Error> {
        self.set_state(LifecycleState::WaitingForDaemon);
        let mut polls = 0u32;
        loop {
            polls += 1;
            if self.link.daemon_available().await? {
                break;
            }
            if polls >= self.config.daemon_poll_attempts {
                return Err(Error::DaemonUnavailable);
            }
            debug!(polls, "daemon not on the bus yet");
            tokio::time::sleep(self.config.daemon_poll_delay()).await;
        }
        self.link.connect().await?;
        self.set_state(LifecycleState::BusConnected);
        self.link.subscribe_signals().await?;
        self.link.register_objects().await?;
        self.set_state(LifecycleState::ObjectsRegistered);
        self.link.register_agent().await?;
        self.link.register_application().await?;
        self.set_state(LifecycleState::ApplicationRegistered);
        match self.link.register_advertisement().await {
            Ok(()) => {}
            // A stale advertisement from a previous incarnation still
            // advertises the right service, so this is not a failure.
            Err(Error::AdvertisementExists) => {
                info!("advertisement already registered, reusing it");
            }
            Err(e) => return Err(e),
        }
        self.set_state(LifecycleState::AdvertisingRegistered);
        self.set_state(LifecycleState::Running);
        Ok(())
    }

    async fn serve(&mut self) -> ServeExit {
        loop {
            tokio::select! {
                outcome = self.link.watch() => match outcome {
                    LinkWatch::Handled => {}
                    LinkWatch::DaemonLost => return ServeExit::DaemonLost,
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Stop) | None => return ServeExit::Stopped,
                    Some(Command::Notify { role, payload }) => {
                        if let Err(e) = self.link.emit_value(role, &payload).await {
                            warn!(
                                characteristic = role.label(),
                                error = %e,
                                "notification not delivered"
                            );
                            self.telemetry.event("notify_failed", &e.to_string());
                        }
                    }
                },
            }
        }
    }

    /// Sleep out the retry delay, still honoring Stop. Returns false when
    /// the peripheral should exit instead of retrying.
    async fn retry_pause(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.retry_delay());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Stop) | None => return false,
                    Some(Command::Notify { role, .. }) => {
                        debug!(
                            characteristic = role.label(),
                            "link is down, dropping notification"
                        );
                    }
                },
            }
        }
    }

    /// Throw away notifications that arrived while the link was down.
    /// Undeliverable notifications are never queued for a later `Running`
    /// phase; the caller must not assume delivery. Returns false when a
    /// stop arrived instead.
    fn discard_stale_notifies(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Notify { role, .. }) => {
                    debug!(
                        characteristic = role.label(),
                        "link is down, dropping notification"
                    );
                }
                Ok(Command::Stop) => return false,
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn set_state(&mut self, state: LifecycleState) {
        info!(%state, "lifecycle state");
        self.telemetry.breadcrumb(&format!("state: {state}"));
        let _ = self.state.send(state);
    }
}

/// What has been registered with the daemon so far, for precise rollback.
#[derive(Debug, Default)]
struct RegistrationLedger {
    objects: bool,
    agent: bool,
    application: bool,
    advertisement: bool,
}

/// The real link: a system bus connection plus the BlueZ handshakes.
pub(crate) struct BluezLink {
    config: PeripheralConfig,
    name: Arc<SharedName>,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    telemetry: Arc<dyn TelemetrySink>,
    adapter_address: Arc<Mutex<Option<String>>>,
    conn: Option<Connection>,
    adapter_path: Option<OwnedObjectPath>,
    device_signals: Option<MessageStream>,
    daemon_owner: Option<zbus::fdo::NameOwnerChangedStream>,
    ledger: RegistrationLedger,
}

impl BluezLink {
    pub(crate) fn new(
        config: PeripheralConfig,
        name: Arc<SharedName>,
        events: mpsc::UnboundedSender<PeripheralEvent>,
        telemetry: Arc<dyn TelemetrySink>,
        adapter_address: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            config,
            name,
            events,
            telemetry,
            adapter_address,
            conn: None,
            adapter_path: None,
            device_signals: None,
            daemon_owner: None,
            ledger: RegistrationLedger::default(),
        }
    }

    async fn connection(&mut self) -> Result<&Connection, Error> {
        if self.conn.is_none() {
            let conn = Connection::system().await.map_err(Error::BusConnection)?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_ref().unwrap_or_else(|| unreachable!()))
    }

    fn adapter_path(&self) -> Result<&OwnedObjectPath, Error> {
        self.adapter_path.as_ref().ok_or(Error::AdapterMissing)
    }

    /// Find an adapter exposing both the GATT and advertising managers,
    /// honoring the configured adapter name when one is set.
    async fn discover_adapter(&mut self) -> Result<OwnedObjectPath, Error> {
        let wanted = self.config.adapter.clone();
        let conn = self.connection().await?.clone();
        let om = zbus::fdo::ObjectManagerProxy::builder(&conn)
            .destination("org.bluez")
            .map_err(Error::BusConnection)?
            .path("/")
            .map_err(Error::BusConnection)?
            .build()
            .await
            .map_err(Error::BusConnection)?;
        let objects = om
            .get_managed_objects()
            .await
            .map_err(|e| Error::BusConnection(e.into()))?;
        for (path, interfaces) in objects {
            let capable = interfaces
                .keys()
                .any(|i| i.as_str() == "org.bluez.GattManager1")
                && interfaces
                    .keys()
                    .any(|i| i.as_str() == "org.bluez.LEAdvertisingManager1");
            if !capable {
                continue;
            }
            if let Some(ref wanted) = wanted {
                if !path.as_str().ends_with(&format!("/{wanted}")) {
                    continue;
                }
            }
            return Ok(path);
        }
        Err(Error::AdapterMissing)
    }
}

#[async_trait]
impl BusLink for BluezLink {
    async fn daemon_available(&mut self) -> Result<bool, Error> {
        let conn = self.connection().await?.clone();
        let dbus = zbus::fdo::DBusProxy::new(&conn)
            .await
            .map_err(Error::BusConnection)?;
        let name = BusName::try_from("org.bluez").map_err(|e| Error::BusConnection(e.into()))?;
        dbus.name_has_owner(name)
            .await
            .map_err(|e| Error::BusConnection(e.into()))
    }

    async fn connect(&mut self) -> Result<(), Error> {
        let path = self.discover_adapter().await?;
        let conn = self.connection().await?.clone();
        let adapter = AdapterProxy::builder(&conn)
            .path(path.clone())
            .map_err(Error::BusConnection)?
            .build()
            .await
            .map_err(Error::BusConnection)?;
        if !adapter.powered().await.map_err(Error::BusConnection)? {
            info!(adapter = %path, "powering adapter on");
            adapter
                .set_powered(true)
                .await
                .map_err(Error::BusConnection)?;
        }
        let address = adapter.address().await.map_err(Error::BusConnection)?;
        info!(adapter = %path, %address, "adapter ready");
        *self
            .adapter_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(address);
        self.adapter_path = Some(path);
        Ok(())
    }

    async fn subscribe_signals(&mut self) -> Result<(), Error> {
        let conn = self.connection().await?.clone();
        let rule = monitor::device_properties_rule().map_err(Error::BusConnection)?;
        let stream = MessageStream::for_match_rule(rule, &conn, Some(64))
            .await
            .map_err(Error::BusConnection)?;
        let dbus = zbus::fdo::DBusProxy::new(&conn)
            .await
            .map_err(Error::BusConnection)?;
        let owner_changes = dbus
            .receive_name_owner_changed_with_args(&[(0, "org.bluez")])
            .await
            .map_err(Error::BusConnection)?;
        self.device_signals = Some(stream);
        self.daemon_owner = Some(owner_changes);
        Ok(())
    }

    async fn register_objects(&mut self) -> Result<(), Error> {
        let events = self.events.clone();
        let telemetry = self.telemetry.clone();
        let name = self.name.clone();
        let conn = self.connection().await?.clone();
        objects::register_tree(&conn, &events, &telemetry)
            .await
            .map_err(|source| Error::Registration {
                what: "object tree",
                source,
            })?;
        let server = conn.object_server();
        server
            .at(protocol::AGENT_PATH, PairingAgent)
            .await
            .map_err(|source| Error::Registration {
                what: "agent object",
                source,
            })?;
        server
            .at(protocol::ADVERTISEMENT_PATH, AdvertisementObj::new(name))
            .await
            .map_err(|source| Error::Registration {
                what: "advertisement object",
                source,
            })?;
        self.ledger.objects = true;
        Ok(())
    }

    async fn register_agent(&mut self) -> Result<(), Error> {
        let conn = self.connection().await?.clone();
        let manager = AgentManagerProxy::new(&conn)
            .await
            .map_err(|source| Error::Registration {
                what: "agent",
                source,
            })?;
        let path = zbus::zvariant::ObjectPath::from_static_str_unchecked(protocol::AGENT_PATH);
        manager
            .register_agent(&path, protocol::AGENT_CAPABILITY)
            .await
            .map_err(|source| Error::Registration {
                what: "agent",
                source,
            })?;
        manager
            .request_default_agent(&path)
            .await
            .map_err(|source| Error::Registration {
                what: "default agent",
                source,
            })?;
        self.ledger.agent = true;
        Ok(())
    }

    async fn register_application(&mut self) -> Result<(), Error> {
        let adapter = self.adapter_path()?.clone();
        let conn = self.connection().await?.clone();
        let manager = GattManagerProxy::builder(&conn)
            .path(adapter)
            .map_err(|source| Error::Registration {
                what: "application",
                source,
            })?
            .build()
            .await
            .map_err(|source| Error::Registration {
                what: "application",
                source,
            })?;
        let path = zbus::zvariant::ObjectPath::from_static_str_unchecked(protocol::APP_PATH);
        manager
            .register_application(&path, HashMap::new())
            .await
            .map_err(|source| Error::Registration {
                what: "application",
                source,
            })?;
        self.ledger.application = true;
        Ok(())
    }

    async fn register_advertisement(&mut self) -> Result<(), Error> {
        let adapter = self.adapter_path()?.clone();
        let conn = self.connection().await?.clone();
        let manager = LEAdvertisingManagerProxy::builder(&conn)
            .path(adapter)
            .map_err(|source| Error::Registration {
                what: "advertisement",
                source,
            })?
            .build()
            .await
            .map_err(|source| Error::Registration {
                what: "advertisement",
                source,
            })?;
        let path =
            zbus::zvariant::ObjectPath::from_static_str_unchecked(protocol::ADVERTISEMENT_PATH);
        match manager.register_advertisement(&path, HashMap::new()).await {
            Ok(()) => {
                self.ledger.advertisement = true;
                Ok(())
            }
            Err(zbus::Error::MethodError(ref ename, _, _))
                if ename.as_str() == "org.bluez.Error.AlreadyExists" =>
            {
                self.ledger.advertisement = true;
                Err(Error::AdvertisementExists)
            }
            Err(source) => Err(Error::Registration {
                what: "advertisement",
                source,
            }),
        }
    }

    async fn watch(&mut self) -> LinkWatch {
        let (signals, owner) = match (&mut self.device_signals, &mut self.daemon_owner) {
            (Some(s), Some(o)) => (s, o),
            // Nothing to wait on means the link is already dead.
            _ => return LinkWatch::DaemonLost,
        };
        tokio::select! {
            msg = signals.next() => match msg {
                Some(Ok(msg)) => {
                    if let Some((device, connected)) = monitor::connection_change(&msg) {
                        info!(%device, connected, "central connection change");
                        self.telemetry.breadcrumb(&format!(
                            "central {device} {}",
                            if connected { "connected" } else { "disconnected" }
                        ));
                        let _ = self.events.send(PeripheralEvent::Connection { device, connected });
                    }
                    LinkWatch::Handled
                }
                Some(Err(e)) => {
                    warn!(error = %e, "signal stream error");
                    LinkWatch::Handled
                }
                None => LinkWatch::DaemonLost,
            },
            change = owner.next() => match change {
                Some(signal) => match signal.args() {
                    Ok(args) if args.new_owner().is_none() => LinkWatch::DaemonLost,
                    Ok(_) => LinkWatch::Handled,
                    Err(e) => {
                        warn!(error = %e, "malformed NameOwnerChanged signal");
                        LinkWatch::Handled
                    }
                },
                None => LinkWatch::DaemonLost,
            },
        }
    }

    async fn emit_value(&mut self, role: CharacteristicRole, payload: &[u8]) -> Result<(), Error> {
        let conn = self.conn.as_ref().ok_or(Error::DaemonUnavailable)?;
        debug!(
            characteristic = role.label(),
            payload = %protocol::hex_preview(payload),
            "emitting value notification"
        );
        let mut changed: HashMap<&str, Value<'_>> = HashMap::new();
        changed.insert("Value", Value::from(payload.to_vec()));
        conn.emit_signal(
            None::<BusName<'_>>,
            role.path(),
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
            &(
                "org.bluez.GattCharacteristic1",
                changed,
                Vec::<String>::new(),
            ),
        )
        .await
        .map_err(Error::BusConnection)
    }

    async fn rollback(&mut self) {
        let timeout = self.config.unregister_timeout();
        if let Some(conn) = self.conn.take() {
            if let Some(adapter) = self.adapter_path.take() {
                if self.ledger.advertisement {
                    let path = zbus::zvariant::ObjectPath::from_static_str_unchecked(
                        protocol::ADVERTISEMENT_PATH,
                    );
                    let unregister = async {
                        let manager = LEAdvertisingManagerProxy::builder(&conn)
                            .path(adapter.clone())?
                            .build()
                            .await?;
                        manager.unregister_advertisement(&path).await
                    };
                    if let Err(e) = flatten_timeout(timeout, unregister).await {
                        debug!(error = %e, "advertisement unregister skipped");
                    }
                }
                if self.ledger.application {
                    let path =
                        zbus::zvariant::ObjectPath::from_static_str_unchecked(protocol::APP_PATH);
                    let unregister = async {
                        let manager = GattManagerProxy::builder(&conn)
                            .path(adapter.clone())?
                            .build()
                            .await?;
                        manager.unregister_application(&path).await
                    };
                    if let Err(e) = flatten_timeout(timeout, unregister).await {
                        debug!(error = %e, "application unregister skipped");
                    }
                }
            }
            if self.ledger.agent {
                let path =
                    zbus::zvariant::ObjectPath::from_static_str_unchecked(protocol::AGENT_PATH);
                let unregister = async {
                    let manager = AgentManagerProxy::new(&conn).await?;
                    manager.unregister_agent(&path).await
                };
                if let Err(e) = flatten_timeout(timeout, unregister).await {
                    debug!(error = %e, "agent unregister skipped");
                }
            }
            if self.ledger.objects {
                objects::remove_tree(&conn).await;
                let server = conn.object_server();
                let _ = server.remove::<PairingAgent, _>(protocol::AGENT_PATH).await;
                let _ = server
                    .remove::<AdvertisementObj, _>(protocol::ADVERTISEMENT_PATH)
                    .await;
            }
        }
        self.ledger = RegistrationLedger::default();
        self.device_signals = None;
        self.daemon_owner = None;
        *self
            .adapter_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn shutdown(&mut self) {
        self.rollback().await;
        debug!("bluez link shut down");
    }
}

/// Run an unregister call under a timeout, folding the timeout itself
/// into the error channel.
async fn flatten_timeout<F>(limit: std::time::Duration, fut: F) -> zbus::Result<()>
where
    F: std::future::Future<Output = zbus::Result<()>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(zbus::Error::Failure("unregister timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_support::RecordingTelemetry;
    use std::collections::VecDeque;

    struct MockLink {
        calls: Arc<Mutex<Vec<&'static str>>>,
        failures: VecDeque<(&'static str, Error)>,
        daemon_script: VecDeque<bool>,
        watch_script: VecDeque<LinkWatch>,
        inject_on_watch: VecDeque<Command>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        emitted: Arc<Mutex<Vec<(CharacteristicRole, Vec<u8>)>>>,
    }

    impl MockLink {
        fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                failures: VecDeque::new(),
                daemon_script: VecDeque::new(),
                watch_script: VecDeque::new(),
                inject_on_watch: VecDeque::new(),
                cmd_tx,
                emitted: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn fail(mut self, step: &'static str, error: Error) -> Self {
            self.failures.push_back((step, error));
            self
        }

        fn step(&mut self, name: &'static str) -> Result<(), Error> {
            self.calls.lock().unwrap().push(name);
            if let Some((when, _)) = self.failures.front() {
                if *when == name {
                    let (_, error) = self.failures.pop_front().unwrap();
                    return Err(error);
                }
            }
            Ok(())
        }

        fn count(&self, name: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == name)
                .count()
        }
    }

    #[async_trait]
    impl BusLink for &mut MockLink {
        async fn daemon_available(&mut self) -> Result<bool, Error> {
            MockLink::step(self, "daemon_available")?;
            Ok(self.daemon_script.pop_front().unwrap_or(true))
        }

        async fn connect(&mut self) -> Result<(), Error> {
            MockLink::step(self, "connect")
        }

        async fn subscribe_signals(&mut self) -> Result<(), Error> {
            MockLink::step(self, "subscribe_signals")
        }

        async fn register_objects(&mut self) -> Result<(), Error> {
            MockLink::step(self, "register_objects")
        }

        async fn register_agent(&mut self) -> Result<(), Error> {
            MockLink::step(self, "register_agent")
        }

        async fn register_application(&mut self) -> Result<(), Error> {
            MockLink::step(self, "register_application")
        }

        async fn register_advertisement(&mut self) -> Result<(), Error> {
            MockLink::step(self, "register_advertisement")
        }

        async fn watch(&mut self) -> LinkWatch {
            self.calls.lock().unwrap().push("watch");
            // Lets a test issue a command from inside the serve loop.
            if let Some(cmd) = self.inject_on_watch.pop_front() {
                let _ = self.cmd_tx.send(cmd);
            }
            match self.watch_script.pop_front() {
                Some(outcome) => outcome,
                None => {
                    // Script exhausted: ask the orchestrator to stop and
                    // park so the Stop command wins the next select.
                    let _ = self.cmd_tx.send(Command::Stop);
                    std::future::pending().await
                }
            }
        }

        async fn emit_value(
            &mut self,
            role: CharacteristicRole,
            payload: &[u8],
        ) -> Result<(), Error> {
            self.emitted.lock().unwrap().push((role, payload.to_vec()));
            Ok(())
        }

        async fn rollback(&mut self) {
            self.calls.lock().unwrap().push("rollback");
        }

        async fn shutdown(&mut self) {
            self.calls.lock().unwrap().push("shutdown");
        }
    }

    fn test_config() -> PeripheralConfig {
        PeripheralConfig {
            max_attempts: 3,
            retry_delay_ms: 1,
            daemon_poll_attempts: 2,
            daemon_poll_delay_ms: 1,
            ..Default::default()
        }
    }

    struct Harness {
        cmd_tx: mpsc::UnboundedSender<Command>,
        cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
        state_tx: Option<watch::Sender<LifecycleState>>,
        state_rx: watch::Receiver<LifecycleState>,
        telemetry: Arc<RecordingTelemetry>,
    }

    fn harness() -> Harness {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        Harness {
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            state_tx: Some(state_tx),
            state_rx,
            telemetry: Arc::new(RecordingTelemetry::default()),
        }
    }

    fn states(telemetry: &RecordingTelemetry) -> Vec<String> {
        telemetry
            .breadcrumbs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| b.strip_prefix("state: ").map(str::to_string))
            .collect()
    }

    async fn run(link: &mut MockLink, config: PeripheralConfig, h: &mut Harness) {
        let cmd_rx = h.cmd_rx.take().unwrap();
        let state_tx = h.state_tx.take().unwrap();
        Orchestrator::new(config, link, cmd_rx, state_tx, h.telemetry.clone())
            .run()
            .await;
    }

    #[tokio::test]
    async fn clean_bring_up_walks_the_states_in_order() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone());
        run(&mut link, test_config(), &mut h).await;

        assert_eq!(
            states(&h.telemetry),
            vec![
                "waiting-for-daemon",
                "bus-connected",
                "objects-registered",
                "application-registered",
                "advertising-registered",
                "running",
                "idle",
            ]
        );
        assert_eq!(
            *link.calls.lock().unwrap(),
            vec![
                "daemon_available",
                "connect",
                "subscribe_signals",
                "register_objects",
                "register_agent",
                "register_application",
                "register_advertisement",
                "watch",
                "shutdown",
            ]
        );
        assert_eq!(*h.state_rx.borrow(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_running() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone())
            .fail(
                "register_application",
                Error::Registration {
                    what: "application",
                    source: zbus::Error::Failure("busy".into()),
                },
            )
            .fail(
                "register_application",
                Error::Registration {
                    what: "application",
                    source: zbus::Error::Failure("busy".into()),
                },
            );
        run(&mut link, test_config(), &mut h).await;

        assert_eq!(link.count("register_application"), 3);
        assert_eq!(link.count("rollback"), 2);
        assert!(states(&h.telemetry).contains(&"running".to_string()));
        assert_eq!(*h.state_rx.borrow(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn attempt_bound_ends_in_failed() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone());
        for _ in 0..3 {
            link = link.fail(
                "connect",
                Error::BusConnection(zbus::Error::Failure("down".into())),
            );
        }
        run(&mut link, test_config(), &mut h).await;

        assert_eq!(link.count("connect"), 3);
        assert_eq!(link.count("rollback"), 3);
        assert_eq!(*h.state_rx.borrow(), LifecycleState::Failed);
        assert_eq!(h.telemetry.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fatal_failure_does_not_retry() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone()).fail("connect", Error::AdapterMissing);
        run(&mut link, test_config(), &mut h).await;

        assert_eq!(link.count("connect"), 1);
        assert_eq!(*h.state_rx.borrow(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn daemon_poll_exhaustion_counts_as_an_attempt() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone());
        link.daemon_script = VecDeque::from(vec![false; 6]);
        run(&mut link, test_config(), &mut h).await;

        // 2 polls per attempt, 3 attempts.
        assert_eq!(link.count("daemon_available"), 6);
        assert_eq!(link.count("connect"), 0);
        assert_eq!(*h.state_rx.borrow(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn daemon_loss_rebuilds_the_link() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone());
        link.watch_script = VecDeque::from(vec![LinkWatch::Handled, LinkWatch::DaemonLost]);
        run(&mut link, test_config(), &mut h).await;

        assert_eq!(link.count("register_application"), 2);
        assert_eq!(link.count("rollback"), 1);
        let states = states(&h.telemetry);
        assert_eq!(
            states.iter().filter(|s| s.as_str() == "running").count(),
            2
        );
        assert_eq!(*h.state_rx.borrow(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn stale_advertisement_is_not_a_failure() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone())
            .fail("register_advertisement", Error::AdvertisementExists);
        run(&mut link, test_config(), &mut h).await;

        assert_eq!(link.count("register_advertisement"), 1);
        assert_eq!(link.count("rollback"), 0);
        assert!(states(&h.telemetry).contains(&"running".to_string()));
    }

    #[tokio::test]
    async fn notifications_are_forwarded_while_running() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone());
        link.watch_script = VecDeque::from(vec![LinkWatch::Handled, LinkWatch::Handled]);
        link.inject_on_watch = VecDeque::from(vec![Command::Notify {
            role: CharacteristicRole::Engineering,
            payload: vec![0xDE, 0xAD],
        }]);
        run(&mut link, test_config(), &mut h).await;

        let emitted = link.emitted.lock().unwrap();
        assert_eq!(
            *emitted,
            vec![(CharacteristicRole::Engineering, vec![0xDE, 0xAD])]
        );
    }

    #[tokio::test]
    async fn notifications_issued_before_running_are_dropped() {
        let mut h = harness();
        let mut link = MockLink::new(h.cmd_tx.clone());
        h.cmd_tx
            .send(Command::Notify {
                role: CharacteristicRole::Engineering,
                payload: vec![0x01],
            })
            .unwrap();
        run(&mut link, test_config(), &mut h).await;

        assert!(link.emitted.lock().unwrap().is_empty());
        assert!(states(&h.telemetry).contains(&"running".to_string()));
    }
}
