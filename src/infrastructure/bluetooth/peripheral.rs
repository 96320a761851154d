//! Public peripheral handle.
//!
//! [`Peripheral`] owns a dedicated dispatch thread running a
//! current-thread tokio runtime; all bus traffic happens there. The
//! handle itself is cheap and synchronous: `start` hands back the event
//! channel, `notify` and `stop` post commands to the dispatch loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::config::PeripheralConfig;
use crate::error::Error;
use crate::infrastructure::bluetooth::advertising::SharedName;
use crate::infrastructure::bluetooth::lifecycle::{
    BluezLink, Command, LifecycleState, Orchestrator,
};
use crate::infrastructure::bluetooth::protocol::CharacteristicRole;
use crate::models::PeripheralEvent;
use crate::telemetry::{self, TelemetrySink};

pub struct Peripheral {
    config: PeripheralConfig,
    name: Arc<SharedName>,
    telemetry: Arc<dyn TelemetrySink>,
    adapter_address: Arc<Mutex<Option<String>>>,
    state_rx: watch::Receiver<LifecycleState>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Peripheral {
    pub fn new(config: PeripheralConfig) -> Result<Self, Error> {
        let config = config.validated()?;
        let name = SharedName::new(config.device_name.clone());
        // Placeholder channel until start; observers see Idle.
        let (_, state_rx) = watch::channel(LifecycleState::Idle);
        Ok(Self {
            config,
            name,
            telemetry: telemetry::noop(),
            adapter_address: Arc::new(Mutex::new(None)),
            state_rx,
            commands: None,
            worker: None,
        })
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Spawn the dispatch thread and begin bring-up. Returns the channel
    /// on which writes and connection changes are delivered.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PeripheralEvent>, Error> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = BluezLink::new(
            self.config.clone(),
            self.name.clone(),
            event_tx,
            self.telemetry.clone(),
            self.adapter_address.clone(),
        );
        let orchestrator = Orchestrator::new(
            self.config.clone(),
            link,
            cmd_rx,
            state_tx,
            self.telemetry.clone(),
        );
        let worker = thread::Builder::new()
            .name("ble-dispatch".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to create tokio runtime for bluetooth dispatch");
                rt.block_on(orchestrator.run());
            })
            .map_err(Error::Spawn)?;
        self.worker = Some(worker);
        self.commands = Some(cmd_tx);
        self.state_rx = state_rx;
        info!(device_name = %self.name.get(), "peripheral started");
        Ok(event_rx)
    }

    /// Tear down gracefully and join the dispatch thread. A no-op when
    /// the peripheral is not running.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Stop);
        }
        if worker.join().is_err() {
            error!("dispatch thread panicked during shutdown");
        }
        info!("peripheral stopped");
    }

    /// Push a payload to subscribers of a notify-capable characteristic.
    ///
    /// Notifications are best-effort and never queued: unless the
    /// lifecycle is in `Running` the payload is dropped with a log line,
    /// matching what a central would observe anyway. Requesting a
    /// characteristic without the notify flag is a caller bug and fails.
    pub fn notify(&self, role: CharacteristicRole, payload: Vec<u8>) -> Result<(), Error> {
        if !role.notify_capable() {
            return Err(Error::NotifyUnsupported);
        }
        if self.state() != LifecycleState::Running {
            debug!(
                characteristic = role.label(),
                "peripheral not running, notification dropped"
            );
            return Ok(());
        }
        if let Some(commands) = &self.commands {
            if commands.send(Command::Notify { role, payload }).is_err() {
                debug!("dispatch loop gone, notification dropped");
            }
        }
        Ok(())
    }

    /// Push an engineering/telemetry payload on the eng characteristic.
    pub fn send_telemetry(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.telemetry.breadcrumb("telemetry push");
        self.notify(CharacteristicRole::Engineering, payload)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    /// A fresh receiver on the lifecycle watch channel. Re-fetch after a
    /// restart; receivers from a previous run go stale.
    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    /// Address of the adapter in use, available once bring-up has
    /// connected to one.
    pub fn adapter_address(&self) -> Option<String> {
        self.adapter_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn device_name(&self) -> String {
        self.name.get()
    }

    /// Change the advertised name. Takes effect the next time the
    /// advertisement is registered.
    pub fn set_device_name(&self, name: &str) {
        self.name.set(name);
        info!(device_name = %self.name.get(), "device name updated");
    }
}

impl Drop for Peripheral {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol;

    fn peripheral() -> Peripheral {
        Peripheral::new(PeripheralConfig::default()).unwrap()
    }

    #[test]
    fn starts_idle_with_no_adapter() {
        let p = peripheral();
        assert_eq!(p.state(), LifecycleState::Idle);
        assert!(p.adapter_address().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PeripheralConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(Peripheral::new(config).is_err());
    }

    #[test]
    fn notify_before_start_is_a_quiet_no_op() {
        let p = peripheral();
        assert!(p.notify(CharacteristicRole::Command, vec![1]).is_ok());
        assert!(p.send_telemetry(vec![2]).is_ok());
    }

    #[test]
    fn notify_on_setup_is_rejected() {
        let p = peripheral();
        assert!(matches!(
            p.notify(CharacteristicRole::Setup, vec![1]),
            Err(Error::NotifyUnsupported)
        ));
    }

    #[test]
    fn device_name_updates_are_bounded() {
        let p = peripheral();
        p.set_device_name(&"n".repeat(100));
        assert_eq!(p.device_name().len(), protocol::MAX_DEVICE_NAME_LEN);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut p = peripheral();
        p.stop();
        assert_eq!(p.state(), LifecycleState::Idle);
    }
}
