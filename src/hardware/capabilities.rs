//! Hardware capability traits
//!
//! Small async traits describing what a device can do, so application code
//! can be written against a capability instead of a concrete driver:
//!
//! - An electronic load implements: `LoadControl + Readable`
//! - A plain voltmeter would implement only: `Readable`
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! # Example
//!
//! ```rust,ignore
//! async fn discharge_until<L>(load: &L, amps: f64, floor_volts: f64) -> Result<()>
//! where
//!     L: LoadControl + Readable,
//! {
//!     load.start_load(amps).await?;
//!     while load.read().await? > floor_volts {
//!         tokio::time::sleep(Duration::from_secs(1)).await;
//!     }
//!     load.stop_load().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Constant-Current Load
///
/// Devices that sink a programmed current from a source (electronic loads,
/// battery analyzers).
///
/// # Contract
/// - `start_load` begins drawing `amps` and fails if a load is already applied
/// - `stop_load` always attempts to remove the load, whatever the current state
/// - `is_loaded` reports whether the device believes it is drawing current
#[async_trait]
pub trait LoadControl: Send + Sync {
    /// Start drawing a constant current, in amps
    async fn start_load(&self, amps: f64) -> Result<()>;

    /// Remove the load
    async fn stop_load(&self) -> Result<()>;

    /// Whether a load is currently applied
    async fn is_loaded(&self) -> Result<bool>;
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (voltmeters, power meters,
/// temperature sensors).
///
/// # Contract
/// - `read()` performs a measurement and returns the value
/// - Units are device-specific (document in implementation)
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    async fn read(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeLoad {
        amps: Mutex<Option<f64>>,
    }

    #[async_trait]
    impl LoadControl for FakeLoad {
        async fn start_load(&self, amps: f64) -> Result<()> {
            let mut current = self.amps.lock();
            if current.is_some() {
                anyhow::bail!("load already applied");
            }
            *current = Some(amps);
            Ok(())
        }

        async fn stop_load(&self) -> Result<()> {
            *self.amps.lock() = None;
            Ok(())
        }

        async fn is_loaded(&self) -> Result<bool> {
            Ok(self.amps.lock().is_some())
        }
    }

    #[async_trait]
    impl Readable for FakeLoad {
        async fn read(&self) -> Result<f64> {
            // 12 V source with 0.1 ohm internal resistance
            let amps = *self.amps.lock();
            Ok(12.0 - amps.unwrap_or(0.0) * 0.1)
        }
    }

    async fn sag<L: LoadControl + Readable>(load: &L, amps: f64) -> Result<f64> {
        let open = load.read().await?;
        load.start_load(amps).await?;
        let loaded = load.read().await?;
        load.stop_load().await?;
        Ok(open - loaded)
    }

    #[tokio::test]
    async fn capabilities_compose() {
        let load = FakeLoad {
            amps: Mutex::new(None),
        };
        let drop = sag(&load, 5.0).await.unwrap();
        assert!((drop - 0.5).abs() < 1e-9);
        assert!(!load.is_loaded().await.unwrap());

        load.start_load(1.0).await.unwrap();
        assert!(load.start_load(1.0).await.is_err());
    }
}
