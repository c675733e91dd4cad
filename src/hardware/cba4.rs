//! CBA4 driver facade.
//!
//! [`Cba4`] is the type applications hold. It wraps one [`LoadController`]
//! behind a mutex, so calls from several threads queue up instead of
//! interleaving on the wire, and runs the watchdog keepalive worker while a
//! load is applied.
//!
//! # Example
//!
//! ```rust
//! use rust_cba::config::DriverConfig;
//! use rust_cba::hardware::Cba4;
//! use rust_cba::transport::SimulatedCba4;
//!
//! # fn main() -> Result<(), rust_cba::DeviceError> {
//! let (sim, _handle) = SimulatedCba4::new();
//! let cba = Cba4::with_transport(Box::new(sim), &DriverConfig::default())?;
//!
//! cba.start_load(1.0)?;
//! let m = cba.read_measurement()?;
//! println!("{:.3} V  {:.3} A  {:.2} W", m.voltage(), m.current(), m.power());
//! cba.stop_load()?;
//! cba.close();
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::controller::{DeviceState, LoadController};
use crate::error::{DeviceError, DeviceResult, TransportError};
use crate::measurement::Measurement;
use crate::protocol::{ExchangeReport, ProtocolEngine};
use crate::transport::Transport;

type SharedController = Arc<Mutex<LoadController<Box<dyn Transport>>>>;

#[cfg(feature = "usb")]
fn open_usb(index: usize) -> Result<Box<dyn Transport>, TransportError> {
    let transport = crate::transport::UsbTransport::open_index(index)?;
    Ok(Box::new(transport))
}

struct KeepaliveWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// A session with one CBA4.
///
/// Closing happens on [`close`](Self::close) or on drop, whichever comes first.
pub struct Cba4 {
    controller: SharedController,
    keepalive: Mutex<Option<KeepaliveWorker>>,
    keepalive_interval: Option<Duration>,
    description: String,
}

impl std::fmt::Debug for Cba4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cba4")
            .field("device", &self.description)
            .field("state", &self.state())
            .finish()
    }
}

impl Cba4 {
    /// Open the instrument selected by `config.device` over USB.
    ///
    /// With a serial number configured, every attached CBA4 is identified in
    /// turn until one matches; otherwise the one at `config.device.index` is
    /// opened.
    #[cfg(feature = "usb")]
    pub fn open(config: &DriverConfig) -> DeviceResult<Self> {
        use crate::transport::{scan, UsbTransport};

        let Some(wanted) = config.device.serial_number else {
            let transport = UsbTransport::open_index(config.device.index)?;
            return Self::with_transport(Box::new(transport), config);
        };
        // Sessions that do not match are dropped, which closes them
        Self::identified(scan()?.len(), config, open_usb)
            .find(|cba| cba.serial_number() == Some(wanted))
            .ok_or_else(|| {
                TransportError::DeviceNotFound(format!("no CBA4 with serial number {wanted}")).into()
            })
    }

    /// Serial numbers of every attached CBA4.
    ///
    /// Each device is briefly opened and identified. Devices that are busy or
    /// do not answer are left out.
    #[cfg(feature = "usb")]
    pub fn scan(config: &DriverConfig) -> DeviceResult<Vec<u32>> {
        use crate::transport::scan;

        Ok(Self::identified(scan()?.len(), config, open_usb)
            .filter_map(|cba| cba.serial_number())
            .collect())
    }

    /// Sessions with each of `count` devices, skipping any that fail to open
    /// or to identify.
    #[cfg_attr(not(feature = "usb"), allow(dead_code))]
    fn identified<'a, F>(
        count: usize,
        config: &'a DriverConfig,
        mut open: F,
    ) -> impl Iterator<Item = Self> + 'a
    where
        F: FnMut(usize) -> Result<Box<dyn Transport>, TransportError> + 'a,
    {
        (0..count).filter_map(move |index| {
            let transport = match open(index) {
                Ok(transport) => transport,
                Err(err) => {
                    debug!(index, error = %err, "skipping device");
                    return None;
                }
            };
            match Self::with_transport(transport, config) {
                Ok(cba) => Some(cba),
                Err(err) => {
                    debug!(index, error = %err, "skipping device");
                    None
                }
            }
        })
    }

    /// Start a session over an already opened transport.
    ///
    /// Sends identify to learn the serial number. A device that does not
    /// answer is still usable, with an unknown serial; a disconnect is not.
    pub fn with_transport(transport: Box<dyn Transport>, config: &DriverConfig) -> DeviceResult<Self> {
        config.validate().map_err(DeviceError::InvalidParameter)?;
        let description = transport.describe();
        let policy = config.retry_policy();
        debug!(
            worst_case_ms = policy.worst_case().as_millis() as u64,
            "exchange time bound"
        );
        let engine = ProtocolEngine::new(transport, config.codec(), policy);
        let mut controller = LoadController::new(engine);

        match controller.identify() {
            Ok(serial_number) => info!(device = %description, serial_number, "session opened"),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!(device = %description, error = %err, "identify failed, serial number unknown"),
        }

        Ok(Self {
            controller: Arc::new(Mutex::new(controller)),
            keepalive: Mutex::new(None),
            keepalive_interval: config.keepalive_interval(),
            description,
        })
    }

    /// Start drawing `amps` of constant current.
    pub fn start_load(&self, amps: f64) -> DeviceResult<()> {
        self.controller.lock().start_load(amps)?;
        self.spawn_keepalive();
        Ok(())
    }

    /// Start drawing `amps` until the voltage falls below `cutoff_volts`.
    pub fn start_load_with_cutoff(&self, amps: f64, cutoff_volts: f64) -> DeviceResult<()> {
        self.controller
            .lock()
            .start_load_with_cutoff(amps, cutoff_volts)?;
        self.spawn_keepalive();
        Ok(())
    }

    /// Stop drawing current. Also the way out of `Faulted`.
    pub fn stop_load(&self) -> DeviceResult<()> {
        self.stop_keepalive();
        self.controller.lock().stop_load()
    }

    /// Take one reading.
    pub fn read_measurement(&self) -> DeviceResult<Measurement> {
        self.controller.lock().read_measurement()
    }

    /// Current state of the session.
    pub fn state(&self) -> DeviceState {
        self.controller.lock().state()
    }

    /// Serial number reported when the session was opened.
    pub fn serial_number(&self) -> Option<u32> {
        self.controller.lock().serial_number()
    }

    /// Outcome of the most recent exchange.
    pub fn last_exchange(&self) -> Option<ExchangeReport> {
        self.controller.lock().engine().last_exchange()
    }

    /// Whether the keepalive worker is alive.
    pub fn keepalive_active(&self) -> bool {
        self.keepalive
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// End the session: stop the load if applied, stop the keepalive and
    /// release the device. Idempotent.
    pub fn close(&self) {
        self.stop_keepalive();
        self.controller.lock().close();
    }

    fn spawn_keepalive(&self) {
        let Some(interval) = self.keepalive_interval else {
            return;
        };
        self.stop_keepalive();

        let (stop, stopped) = mpsc::channel::<()>();
        let controller = Arc::clone(&self.controller);
        let spawned = thread::Builder::new()
            .name("cba4-keepalive".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "keepalive started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let mut controller = controller.lock();
                    if controller.state() != DeviceState::Running {
                        break;
                    }
                    if let Err(err) = controller.keepalive() {
                        if err.is_fatal() {
                            break;
                        }
                        warn!(error = %err, "keepalive poll failed");
                    }
                }
                debug!("keepalive stopped");
            });

        match spawned {
            Ok(handle) => *self.keepalive.lock() = Some(KeepaliveWorker { stop, handle }),
            Err(err) => warn!(error = %err, "could not start keepalive thread, load may time out"),
        }
    }

    fn stop_keepalive(&self) {
        let worker = self.keepalive.lock().take();
        if let Some(worker) = worker {
            // The worker may be blocked on the controller lock; never hold it here
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                warn!("keepalive thread panicked");
            }
        }
    }
}

impl Drop for Cba4 {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::transport::{MockTransport, SimHandle, SimulatedCba4};

    fn config(keepalive_ms: Option<u64>) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.protocol.timeout_ms = 20;
        config.protocol.max_retries = 1;
        config.protocol.retry_backoff_ms = 0;
        match keepalive_ms {
            Some(ms) => config.keepalive.interval_ms = ms,
            None => config.keepalive.enabled = false,
        }
        config
    }

    fn simulated(keepalive_ms: Option<u64>) -> (Cba4, SimHandle) {
        let (sim, handle) = SimulatedCba4::new();
        handle.set_serial_number(31337);
        let cba = Cba4::with_transport(Box::new(sim), &config(keepalive_ms)).unwrap();
        (cba, handle)
    }

    #[test]
    fn open_identifies_the_device() {
        let (cba, handle) = simulated(None);
        assert_eq!(cba.serial_number(), Some(31337));
        assert_eq!(cba.state(), DeviceState::Idle);
        assert_eq!(handle.identify_count(), 1);
    }

    #[test]
    fn silent_device_opens_without_serial() {
        let (mock, _handle) = MockTransport::new();
        let cba = Cba4::with_transport(Box::new(mock), &config(None)).unwrap();
        assert_eq!(cba.serial_number(), None);
        assert_eq!(cba.state(), DeviceState::Idle);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (sim, _handle) = SimulatedCba4::new();
        let mut config = config(None);
        config.protocol.timeout_ms = 0;
        assert!(matches!(
            Cba4::with_transport(Box::new(sim), &config),
            Err(DeviceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn keepalive_runs_only_while_loaded() {
        let (cba, handle) = simulated(Some(50));
        cba.start_load(1.0).unwrap();
        assert!(cba.keepalive_active());
        thread::sleep(Duration::from_millis(300));
        assert!(handle.poll_count() >= 2, "polls: {}", handle.poll_count());

        cba.stop_load().unwrap();
        assert!(!cba.keepalive_active());
        let polls = handle.poll_count();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(handle.poll_count(), polls);
    }

    #[test]
    fn keepalive_holds_off_the_watchdog() {
        let (cba, handle) = simulated(Some(50));
        handle.enable_watchdog(Duration::from_millis(400));
        cba.start_load(1.0).unwrap();
        thread::sleep(Duration::from_millis(700));
        assert!(handle.is_running());
        assert_eq!(cba.read_measurement().unwrap().current(), 1.0);
        cba.stop_load().unwrap();
    }

    #[test]
    fn without_keepalive_the_watchdog_drops_the_load() {
        let (cba, handle) = simulated(None);
        handle.enable_watchdog(Duration::from_millis(100));
        cba.start_load(1.0).unwrap();
        thread::sleep(Duration::from_millis(250));
        let m = cba.read_measurement().unwrap();
        assert!(!m.flags().running);
        assert_eq!(cba.state(), DeviceState::Idle);
    }

    #[test]
    fn unplug_while_loaded_ends_keepalive_and_session() {
        let (cba, handle) = simulated(Some(50));
        cba.start_load(1.0).unwrap();
        handle.unplug();
        thread::sleep(Duration::from_millis(250));

        assert_eq!(cba.state(), DeviceState::Disconnected);
        assert!(!cba.keepalive_active());
        let sent = handle.commands().len();
        assert_eq!(cba.stop_load(), Err(DeviceError::Disconnected));
        assert_eq!(handle.commands().len(), sent);
    }

    #[test]
    fn search_skips_devices_that_fail_to_open_or_identify() {
        let mut sims = Vec::new();
        let mut handles = Vec::new();
        for serial in [5, 7, 9] {
            let (sim, handle) = SimulatedCba4::new();
            handle.set_serial_number(serial);
            sims.push(Some(sim));
            handles.push(handle);
        }
        handles[0].unplug();

        let config = config(None);
        let serials: Vec<u32> = Cba4::identified(4, &config, |index| {
            sims.get_mut(index)
                .and_then(Option::take)
                .map(|sim| Box::new(sim) as Box<dyn Transport>)
                .ok_or_else(|| TransportError::OpenFailed("busy".into()))
        })
        .filter_map(|cba| cba.serial_number())
        .collect();

        assert_eq!(serials, vec![7, 9]);
        assert_eq!(handles[0].identify_count(), 0);
        // Every session opened for the search was closed again
        assert!(handles.iter().all(|handle| !handle.is_running()));
        assert_eq!(handles[2].commands().last(), Some(&Command::stop()));
    }

    #[test]
    fn drop_stops_the_load_and_releases_the_device() {
        let (cba, handle) = simulated(Some(50));
        cba.start_load(2.0).unwrap();
        drop(cba);
        assert!(!handle.is_running());
        assert_eq!(handle.commands().last(), Some(&Command::stop()));
    }
}
