//! Async facade tests: `AsyncCba4` over the simulated instrument.

use rust_cba::hardware::{AsyncCba4, Cba4, LoadControl, Readable};
use rust_cba::transport::{SimHandle, SimulatedCba4};
use rust_cba::{DeviceError, DeviceState, DriverConfig};
use std::time::Duration;

fn open(keepalive_ms: Option<u64>) -> (AsyncCba4, SimHandle) {
    let mut config = DriverConfig::default();
    config.protocol.timeout_ms = 20;
    config.protocol.retry_backoff_ms = 0;
    match keepalive_ms {
        Some(ms) => config.keepalive.interval_ms = ms,
        None => config.keepalive.enabled = false,
    }
    let (sim, handle) = SimulatedCba4::new();
    let cba = Cba4::with_transport(Box::new(sim), &config).expect("session should open");
    (AsyncCba4::new(cba), handle)
}

/// Discharge helper written only against the capability traits.
async fn voltage_under_load<L>(load: &L, amps: f64) -> anyhow::Result<f64>
where
    L: LoadControl + Readable,
{
    load.start_load(amps).await?;
    let volts = load.read().await?;
    load.stop_load().await?;
    Ok(volts)
}

#[tokio::test]
async fn test_capability_generic_code() {
    let (cba, handle) = open(None);
    let volts = voltage_under_load(&cba, 4.0).await.unwrap();
    assert!((volts - 11.8).abs() < 1e-3, "volts: {volts}");
    assert!(!handle.is_running());
    assert!(!LoadControl::is_loaded(&cba).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clones_share_one_session() {
    let (cba, handle) = open(None);
    cba.start_load(1.5).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cba = cba.clone();
            tokio::spawn(async move { cba.read_measurement().await })
        })
        .collect();
    for task in tasks {
        let m = task.await.unwrap().unwrap();
        assert!((m.current() - 1.5).abs() < 1e-3);
    }
    assert_eq!(handle.poll_count(), 8);

    cba.close().await.unwrap();
    assert_eq!(cba.state(), DeviceState::Disconnected);
    assert!(matches!(
        cba.read_measurement().await,
        Err(DeviceError::Disconnected)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keepalive_runs_under_async_use() {
    let (cba, handle) = open(Some(50));
    handle.enable_watchdog(Duration::from_millis(300));

    cba.start_load(1.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(handle.is_running());
    assert!(cba.blocking().keepalive_active());
    cba.stop_load().await.unwrap();
    assert!(!cba.blocking().keepalive_active());
}
