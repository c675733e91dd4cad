//! Async facade over [`Cba4`].
//!
//! Every exchange blocks for up to timeout × attempts, so each call is moved
//! onto tokio's blocking pool with `spawn_blocking`. The underlying lock still
//! serializes the calls.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::capabilities::{LoadControl, Readable};
use super::cba4::Cba4;
use crate::controller::DeviceState;
use crate::error::{DeviceError, DeviceResult};
use crate::measurement::Measurement;

/// Cloneable async handle to a [`Cba4`] session.
#[derive(Debug, Clone)]
pub struct AsyncCba4 {
    device: Arc<Cba4>,
}

impl AsyncCba4 {
    /// Wrap an open session.
    pub fn new(device: Cba4) -> Self {
        Self {
            device: Arc::new(device),
        }
    }

    /// The blocking session underneath.
    pub fn blocking(&self) -> &Cba4 {
        &self.device
    }

    async fn run<R, F>(&self, operation: F) -> DeviceResult<R>
    where
        F: FnOnce(&Cba4) -> DeviceResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || operation(&device))
            .await
            .map_err(|e| DeviceError::TaskFailed(e.to_string()))?
    }

    /// Start drawing `amps` of constant current.
    pub async fn start_load(&self, amps: f64) -> DeviceResult<()> {
        self.run(move |cba| cba.start_load(amps)).await
    }

    /// Start drawing `amps` until the voltage falls below `cutoff_volts`.
    pub async fn start_load_with_cutoff(&self, amps: f64, cutoff_volts: f64) -> DeviceResult<()> {
        self.run(move |cba| cba.start_load_with_cutoff(amps, cutoff_volts))
            .await
    }

    /// Stop drawing current.
    pub async fn stop_load(&self) -> DeviceResult<()> {
        self.run(|cba| cba.stop_load()).await
    }

    /// Take one reading.
    pub async fn read_measurement(&self) -> DeviceResult<Measurement> {
        self.run(|cba| cba.read_measurement()).await
    }

    /// End the session.
    pub async fn close(&self) -> DeviceResult<()> {
        self.run(|cba| {
            cba.close();
            Ok(())
        })
        .await
    }

    /// Current state of the session.
    pub fn state(&self) -> DeviceState {
        self.device.state()
    }

    /// Serial number reported when the session was opened.
    pub fn serial_number(&self) -> Option<u32> {
        self.device.serial_number()
    }
}

#[async_trait]
impl LoadControl for AsyncCba4 {
    async fn start_load(&self, amps: f64) -> Result<()> {
        Ok(AsyncCba4::start_load(self, amps).await?)
    }

    async fn stop_load(&self) -> Result<()> {
        Ok(AsyncCba4::stop_load(self).await?)
    }

    async fn is_loaded(&self) -> Result<bool> {
        let state = self.run(|cba| Ok(cba.state())).await?;
        Ok(state == DeviceState::Running)
    }
}

/// Reads terminal voltage, in volts.
#[async_trait]
impl Readable for AsyncCba4 {
    async fn read(&self) -> Result<f64> {
        Ok(self.read_measurement().await?.voltage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::transport::SimulatedCba4;

    fn device() -> AsyncCba4 {
        let (sim, _handle) = SimulatedCba4::new();
        let mut config = DriverConfig::default();
        config.keepalive.enabled = false;
        AsyncCba4::new(Cba4::with_transport(Box::new(sim), &config).unwrap())
    }

    #[tokio::test]
    async fn drives_the_load_through_capabilities() {
        let cba = device();
        let open_circuit = Readable::read(&cba).await.unwrap();
        assert_eq!(open_circuit, 12.0);

        LoadControl::start_load(&cba, 2.0).await.unwrap();
        assert!(cba.is_loaded().await.unwrap());
        assert!(Readable::read(&cba).await.unwrap() < open_circuit);

        LoadControl::stop_load(&cba).await.unwrap();
        assert!(!cba.is_loaded().await.unwrap());
    }

    #[tokio::test]
    async fn device_errors_surface_through_anyhow() {
        let cba = device();
        cba.start_load(1.0).await.unwrap();
        let err = LoadControl::start_load(&cba, 1.0).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::InvalidStateTransition { .. })
        ));
        cba.close().await.unwrap();
        assert_eq!(cba.state(), DeviceState::Disconnected);
    }
}
