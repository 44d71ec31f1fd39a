//! Common test utilities for integration tests.
//!
//! Every fixture builds its own registry and mock backend, so tests never
//! share line claims. Sensors use [`TriggerTiming::immediate`] so a read only
//! blocks for the mock's bookkeeping.
//!
//! # Waveforms
//!
//! [`frame_edges`] renders a DHT22 frame as the edges a real sensor would
//! produce after the host releases the line:
//!
//! ```text
//!   ‾‾\________/‾‾‾‾‾‾‾‾\_____/‾‾‾\_____/‾‾‾‾‾‾‾\ ... _____/‾‾
//!     20   80      80     50   26   50     70          50
//! ```

#![allow(dead_code)]

use pinwire_core::{Error, Level, LineId};
use pinwire_hardware::mock::{MockBackend, MockBackendHandle};
use pinwire_hardware::{Backend, Pin, PinConfig, PinRegistry};
use pinwire_protocol::dht22::{Dht22, Dht22Config, Frame, Reading, ReadingListener, TriggerTiming};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Data line used by every fixture.
pub const DATA_LINE: LineId = LineId::new(4);

/// Frame from the reference datasheet: 65.2 %RH, 35.1 °C.
pub const FRAME_POSITIVE: Frame = [0x02, 0x8C, 0x01, 0x5F, 0xEE];

/// 65.2 %RH, -14.7 °C.
pub const FRAME_NEGATIVE: Frame = [0x02, 0x8C, 0x80, 0x93, 0xA1];

/// FRAME_POSITIVE with a corrupted checksum byte.
pub const FRAME_BAD_CHECKSUM: Frame = [0x02, 0x8C, 0x01, 0x5F, 0x00];

/// High pulse of a `0` bit, in microseconds.
pub const ZERO_US: u64 = 26;

/// High pulse of a `1` bit, in microseconds.
pub const ONE_US: u64 = 70;

/// Low separator before each bit, in microseconds.
pub const SEPARATOR_US: u64 = 50;

pub struct Fixture {
    pub registry: Arc<PinRegistry>,
    pub handle: MockBackendHandle,
    pub sensor: Dht22,
}

/// Open a DHT22 on [`DATA_LINE`] of a fresh mock backend.
pub fn sensor() -> Fixture {
    sensor_with(Dht22Config::default())
}

pub fn sensor_with(config: Dht22Config) -> Fixture {
    sensor_on(PinConfig::output(DATA_LINE), config)
}

/// Open a DHT22 on a data pin opened with `pin_config`.
pub fn sensor_on(pin_config: PinConfig, config: Dht22Config) -> Fixture {
    let (mock, handle) = MockBackend::new();
    let registry = Arc::new(PinRegistry::new());
    let pin = Pin::open_in(&registry, &Backend::from(mock), pin_config)
        .expect("Failed to open data pin");
    let sensor = Dht22::new(pin, config.with_trigger(TriggerTiming::immediate()))
        .expect("Failed to create sensor");

    Fixture {
        registry,
        handle,
        sensor,
    }
}

/// Edges a sensor emits for `frame`, as `(new level, delay before the edge)`.
pub fn frame_edges(frame: &Frame) -> Vec<(Level, Duration)> {
    frame_edges_with(frame, ZERO_US, ONE_US)
}

/// Like [`frame_edges`] with custom bit pulse widths.
pub fn frame_edges_with(frame: &Frame, zero_us: u64, one_us: u64) -> Vec<(Level, Duration)> {
    let us = Duration::from_micros;
    let mut edges = vec![
        (Level::Low, us(20)),
        (Level::High, us(80)),
        (Level::Low, us(80)),
    ];
    for byte in frame {
        for bit in (0..8).rev() {
            let high = if (byte >> bit) & 1 == 1 { one_us } else { zero_us };
            edges.push((Level::High, us(SEPARATOR_US)));
            edges.push((Level::Low, us(high)));
        }
    }
    edges.push((Level::High, us(SEPARATOR_US)));
    edges
}

/// Play `frame` on the data line.
pub fn send_frame(handle: &MockBackendHandle, frame: &Frame) {
    handle.emit_all(DATA_LINE, &frame_edges(frame));
}

/// Frame with a correct checksum for four data bytes.
pub fn with_checksum(data: [u8; 4]) -> Frame {
    let sum = data.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    [data[0], data[1], data[2], data[3], sum]
}

/// Wait until the poller has armed a capture on the data line.
pub async fn wait_for_capture(handle: &MockBackendHandle) {
    for _ in 0..1_000 {
        if handle.edge_detect_enabled(DATA_LINE) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("capture was never armed");
}

/// Listener recording every callback.
#[derive(Default)]
pub struct Recorder {
    pub readings: Mutex<Vec<Reading>>,
    pub checksums: Mutex<Vec<(u8, u8)>>,
    pub errors: Mutex<Vec<Error>>,
}

impl Recorder {
    pub fn attach(sensor: &Dht22) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn ReadingListener> = recorder.clone();
        sensor.set_listener(Some(&listener));
        recorder
    }

    pub fn reading_count(&self) -> usize {
        self.readings.lock().unwrap().len()
    }

    pub fn checksum_count(&self) -> usize {
        self.checksums.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl ReadingListener for Recorder {
    fn on_reading(&self, reading: Reading) {
        self.readings.lock().unwrap().push(reading);
    }

    fn on_invalid_checksum(&self, expected: u8, actual: u8) -> bool {
        self.checksums.lock().unwrap().push((expected, actual));
        true
    }

    fn on_error(&self, error: Error) {
        self.errors.lock().unwrap().push(error);
    }
}
