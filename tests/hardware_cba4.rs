//! Hardware integration tests for the CBA4 battery analyzer
//!
//! These tests require a real instrument on USB.
//! Run with: cargo test --test hardware_cba4 --features hardware_tests -- --ignored --nocapture
//!
//! Hardware Setup:
//! - One CBA4 attached, libusb access to vendor 0x2405 product 0x0005
//!   (on Linux a udev rule granting the user access)
//! - A charged battery or bench supply on the load terminals able to deliver
//!   0.5 A without dropping below 1 V
//! - Optional: RUST_CBA_DEVICE__SERIAL_NUMBER to pick one of several units
//!
//! SAFETY NOTES:
//! - The load draws current from whatever is connected; never leave a test
//!   running against an unattended lithium cell

#![cfg(all(feature = "usb", feature = "hardware_tests"))]

use rust_cba::{Cba4, DeviceState, DriverConfig};
use std::thread;
use std::time::Duration;

fn open() -> Cba4 {
    let config = DriverConfig::load().expect("configuration should load");
    Cba4::open(&config).expect("a CBA4 should be attached")
}

#[test]
#[ignore] // Hardware-only test
fn test_scan_lists_attached_units() {
    let devices = rust_cba::transport::scan().unwrap();
    println!("attached: {devices:?}");
    assert!(!devices.is_empty());

    let serials = Cba4::scan(&DriverConfig::default()).unwrap();
    println!("serial numbers: {serials:?}");
    assert_eq!(serials.len(), devices.len());
}

#[test]
#[ignore] // Hardware-only test
fn test_identify_and_idle_reading() {
    let cba = open();
    println!("serial number: {:?}", cba.serial_number());
    assert!(cba.serial_number().is_some());

    let m = cba.read_measurement().unwrap();
    println!("open circuit: {:.3} V", m.voltage());
    assert_eq!(m.current(), 0.0);
    assert!(!m.flags().running);
}

#[test]
#[ignore] // Hardware-only test
fn test_short_discharge() {
    let cba = open();
    cba.start_load_with_cutoff(0.5, 1.0).unwrap();
    assert!(cba.keepalive_active());

    // Longer than the instrument's watchdog, so the keepalive has to work
    for _ in 0..5 {
        thread::sleep(Duration::from_secs(1));
        let m = cba.read_measurement().unwrap();
        println!("{:.3} V  {:.3} A  {:.2} W", m.voltage(), m.current(), m.power());
        assert!(m.flags().running);
    }

    cba.stop_load().unwrap();
    assert_eq!(cba.state(), DeviceState::Idle);
    assert_eq!(cba.read_measurement().unwrap().current(), 0.0);
    cba.close();
}
