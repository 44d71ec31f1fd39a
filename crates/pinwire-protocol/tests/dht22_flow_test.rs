//! Integration tests for the trigger → capture → decode flow.
//!
//! Sensor responses are played through the mock backend's edge emitter,
//! exactly as a backend thread would deliver them.

mod common;

use common::{DATA_LINE, FRAME_BAD_CHECKSUM, FRAME_NEGATIVE, FRAME_POSITIVE, Recorder};
use pinwire_core::{DesyncReason, Edges, Error, Level};
use pinwire_hardware::PinConfig;
use pinwire_protocol::dht22::{Dht22, Dht22Config, Dht22State, Reading, ReadingListener};
use pinwire_protocol::poller::{Dht22Poller, PollEvent, PollerConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Single Reads
// ============================================================================

#[test]
fn test_positive_temperature_frame() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    common::send_frame(&fixture.handle, &FRAME_POSITIVE);

    let readings = recorder.readings.lock().unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].temperature(), 35.1);
    assert_eq!(readings[0].humidity(), 65.2);
}

#[test]
fn test_read_on_pin_opened_for_falling_edges() {
    let pin_config = PinConfig::output(DATA_LINE).with_edges(Edges::Falling);
    let fixture = common::sensor_on(pin_config, Dht22Config::default());
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    assert_eq!(fixture.handle.edge_filter(DATA_LINE), Some(Edges::Both));
    common::send_frame(&fixture.handle, &FRAME_POSITIVE);

    assert_eq!(recorder.reading_count(), 1);
    assert_eq!(recorder.error_count(), 0);
}

#[test]
fn test_negative_temperature_frame() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    common::send_frame(&fixture.handle, &FRAME_NEGATIVE);

    let readings = recorder.readings.lock().unwrap();
    assert_eq!(readings[0].temperature(), -14.7);
    assert_eq!(readings[0].humidity(), 65.2);
}

#[test]
fn test_bad_checksum_never_reaches_on_reading() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    common::send_frame(&fixture.handle, &FRAME_BAD_CHECKSUM);

    assert_eq!(recorder.checksum_count(), 1);
    assert_eq!(recorder.reading_count(), 0);
    assert_eq!(recorder.error_count(), 0);
    assert_eq!(fixture.sensor.state(), Dht22State::Idle);
}

#[test]
fn test_bad_checksum_without_listener_is_harmless() {
    let fixture = common::sensor();

    fixture.sensor.read().unwrap();
    common::send_frame(&fixture.handle, &FRAME_BAD_CHECKSUM);

    assert_eq!(fixture.sensor.state(), Dht22State::Idle);
    assert!(fixture.sensor.read().is_ok());
}

#[test]
fn test_dropped_bit_is_desync() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    let mut edges = common::frame_edges(&FRAME_POSITIVE);
    // Drop the separator of bit 10 so two falling edges arrive in a row.
    edges.remove(3 + 2 * 10);
    fixture.handle.emit_all(DATA_LINE, &edges);

    let errors = recorder.errors.lock().unwrap();
    assert!(matches!(
        errors.as_slice(),
        [Error::Desync(DesyncReason::RepeatedLevel { level: Level::Low })]
    ));
    assert_eq!(recorder.reading_count(), 0);
    assert!(!fixture.handle.edge_detect_enabled(DATA_LINE));
}

#[test]
fn test_out_of_range_pulse_is_desync() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    // A 45 µs high pulse sits between the `0` and `1` ranges.
    let edges = common::frame_edges_with(&FRAME_POSITIVE, 45, 70);
    fixture.handle.emit_all(DATA_LINE, &edges);

    let errors = recorder.errors.lock().unwrap();
    assert!(matches!(
        errors.as_slice(),
        [Error::Desync(DesyncReason::BitOutOfRange { bit_index: 0, .. })]
    ));
}

#[test]
fn test_noise_before_response_is_tolerated() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    fixture.sensor.read().unwrap();
    let us = Duration::from_micros;
    // A glitch on the released line before the sensor answers.
    fixture.handle.emit(DATA_LINE, Level::Low, us(5));
    fixture.handle.emit(DATA_LINE, Level::High, us(3));
    common::send_frame(&fixture.handle, &FRAME_POSITIVE);

    assert_eq!(recorder.reading_count(), 1);
}

#[test]
fn test_read_again_after_reading() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);

    for frame in [FRAME_POSITIVE, FRAME_NEGATIVE] {
        fixture.sensor.read().unwrap();
        common::send_frame(&fixture.handle, &frame);
    }

    let temperatures: Vec<f64> = recorder
        .readings
        .lock()
        .unwrap()
        .iter()
        .map(Reading::temperature)
        .collect();
    assert_eq!(temperatures, vec![35.1, -14.7]);
}

/// Starts the next read from inside the checksum callback.
struct Retrier {
    sensor: Mutex<Option<Dht22>>,
    retries: Mutex<u32>,
    readings: Mutex<Vec<Reading>>,
}

impl ReadingListener for Retrier {
    fn on_reading(&self, reading: Reading) {
        self.readings.lock().unwrap().push(reading);
    }

    fn on_invalid_checksum(&self, _expected: u8, _actual: u8) -> bool {
        *self.retries.lock().unwrap() += 1;
        let sensor = self.sensor.lock().unwrap().clone();
        sensor.is_some_and(|sensor| sensor.read().is_ok())
    }
}

#[test]
fn test_listener_can_retry_from_callback() {
    let fixture = common::sensor();
    let retrier = Arc::new(Retrier {
        sensor: Mutex::new(Some(fixture.sensor.clone())),
        retries: Mutex::new(0),
        readings: Mutex::new(Vec::new()),
    });
    let listener: Arc<dyn ReadingListener> = retrier.clone();
    fixture.sensor.set_listener(Some(&listener));

    fixture.sensor.read().unwrap();
    common::send_frame(&fixture.handle, &FRAME_BAD_CHECKSUM);
    assert_eq!(fixture.sensor.state(), Dht22State::Capturing);
    common::send_frame(&fixture.handle, &FRAME_POSITIVE);

    assert_eq!(*retrier.retries.lock().unwrap(), 1);
    assert_eq!(retrier.readings.lock().unwrap().len(), 1);
    *retrier.sensor.lock().unwrap() = None;
}

#[test]
fn test_dropped_listener_is_not_called() {
    let fixture = common::sensor();
    let recorder = Recorder::attach(&fixture.sensor);
    let weak = Arc::downgrade(&recorder);
    drop(recorder);

    fixture.sensor.read().unwrap();
    common::send_frame(&fixture.handle, &FRAME_POSITIVE);

    assert!(weak.upgrade().is_none());
    assert_eq!(fixture.sensor.state(), Dht22State::Idle);
}

#[test]
fn test_close_releases_line() {
    let fixture = common::sensor();
    fixture.sensor.read().unwrap();

    fixture.sensor.close().unwrap();

    assert!(fixture.registry.is_empty());
    assert!(!fixture.handle.is_open(DATA_LINE));
    assert!(matches!(fixture.sensor.read(), Err(Error::Closed(_))));
}

// ============================================================================
// Poller
// ============================================================================

fn fast_poller() -> PollerConfig {
    PollerConfig::default()
        .with_interval(Duration::from_millis(1))
        .with_read_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn test_poller_delivers_reading() {
    let fixture = common::sensor();
    let mut handle = Dht22Poller::new(fixture.sensor.clone(), fast_poller().with_max_cycles(1)).start();

    common::wait_for_capture(&fixture.handle).await;
    common::send_frame(&fixture.handle, &FRAME_POSITIVE);

    match handle.recv().await {
        Some(PollEvent::Reading(reading)) => assert_eq!(reading.temperature(), 35.1),
        other => panic!("expected a reading, got {other:?}"),
    }
    assert!(handle.recv().await.is_none());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_retries_checksum_then_gives_up() {
    let fixture = common::sensor();
    let config = fast_poller().with_max_cycles(1).with_max_checksum_retries(2);
    let mut handle = Dht22Poller::new(fixture.sensor.clone(), config).start();

    for _ in 0..3 {
        common::wait_for_capture(&fixture.handle).await;
        common::send_frame(&fixture.handle, &FRAME_BAD_CHECKSUM);
    }

    match handle.recv().await {
        Some(PollEvent::Failed {
            error: Error::ChecksumMismatch { expected, actual },
            attempts,
        }) => {
            assert_eq!((expected, actual), (0xEE, 0x00));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a checksum failure, got {other:?}"),
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_recovers_after_one_bad_checksum() {
    let fixture = common::sensor();
    let mut handle = Dht22Poller::new(fixture.sensor.clone(), fast_poller().with_max_cycles(1)).start();

    common::wait_for_capture(&fixture.handle).await;
    common::send_frame(&fixture.handle, &FRAME_BAD_CHECKSUM);
    common::wait_for_capture(&fixture.handle).await;
    common::send_frame(&fixture.handle, &FRAME_NEGATIVE);

    match handle.recv().await {
        Some(PollEvent::Reading(reading)) => assert_eq!(reading.temperature(), -14.7),
        other => panic!("expected a reading, got {other:?}"),
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_times_out_silent_sensor() {
    let fixture = common::sensor();
    let config = fast_poller()
        .with_read_timeout(Duration::from_millis(50))
        .with_max_cycles(1);
    let mut handle = Dht22Poller::new(fixture.sensor.clone(), config).start();

    match handle.recv().await {
        Some(PollEvent::Failed {
            error: Error::Timeout { duration_ms },
            attempts,
        }) => {
            assert_eq!(duration_ms, 50);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(fixture.sensor.state(), Dht22State::Idle);
    assert!(!fixture.handle.edge_detect_enabled(DATA_LINE));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_does_not_retry_desync() {
    let fixture = common::sensor();
    let mut handle = Dht22Poller::new(fixture.sensor.clone(), fast_poller().with_max_cycles(1)).start();

    common::wait_for_capture(&fixture.handle).await;
    let edges = common::frame_edges_with(&FRAME_POSITIVE, 10, 70);
    fixture.handle.emit_all(DATA_LINE, &edges);

    match handle.recv().await {
        Some(PollEvent::Failed {
            error: Error::Desync(_),
            attempts,
        }) => assert_eq!(attempts, 1),
        other => panic!("expected a desync, got {other:?}"),
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_shutdown_cancels_read() {
    let fixture = common::sensor();
    let handle = Dht22Poller::new(fixture.sensor.clone(), fast_poller()).start();

    common::wait_for_capture(&fixture.handle).await;
    // Let the blocking read hand its session back before cancelling.
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.shutdown().await.unwrap();

    assert_eq!(fixture.sensor.state(), Dht22State::Idle);
    assert!(!fixture.handle.edge_detect_enabled(DATA_LINE));
}
