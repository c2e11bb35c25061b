// UART ultrasonic range finder
//
// The sensor streams 4-byte frames: [0xFF, Data_H, Data_L, Checksum]
// Distance is Data_H:Data_L in millimetres; checksum is the low byte of
// 0xFF + Data_H + Data_L.

use serialport::{self, SerialPort};
use std::io::Read;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::DistanceSensor;

/// Default serial configuration for UART range finders
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Frame header byte
const HEADER: u8 = 0xFF;

/// Bytes skipped while hunting for a header before giving up
const MAX_SYNC_BYTES: usize = 16;

/// Error types for range finder communication
#[derive(Debug, thiserror::Error)]
pub enum RangeFinderError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No frame header within {0} bytes")]
    NoHeader(usize),

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Timeout waiting for a frame")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, RangeFinderError>;

/// Calculate checksum for a frame (header + two data bytes)
fn checksum(data: &[u8]) -> u8 {
    let sum: u16 = data.iter().map(|&b| b as u16).sum();
    (sum & 0xFF) as u8
}

fn map_timeout(e: std::io::Error) -> RangeFinderError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        RangeFinderError::Timeout
    } else {
        RangeFinderError::Io(e)
    }
}

/// Read one frame and return the distance in millimetres
fn read_frame<R: Read>(reader: &mut R) -> Result<u16> {
    let mut byte = [0u8; 1];
    let mut skipped = 0;
    loop {
        reader.read_exact(&mut byte).map_err(map_timeout)?;
        if byte[0] == HEADER {
            break;
        }
        skipped += 1;
        if skipped >= MAX_SYNC_BYTES {
            return Err(RangeFinderError::NoHeader(skipped));
        }
    }

    let mut body = [0u8; 3];
    reader.read_exact(&mut body).map_err(map_timeout)?;

    let expected = checksum(&[HEADER, body[0], body[1]]);
    if expected != body[2] {
        return Err(RangeFinderError::ChecksumMismatch {
            expected,
            actual: body[2],
        });
    }

    Ok(u16::from_be_bytes([body[0], body[1]]))
}

/// Range finder on a serial port
pub struct SerialRangeFinder {
    port: Mutex<Box<dyn SerialPort>>,
    max_distance_cm: f32,
}

impl SerialRangeFinder {
    /// Open a new connection to the sensor
    pub fn open(port_name: &str, max_distance_cm: f32) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE, max_distance_cm)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32, max_distance_cm: f32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            port: Mutex::new(port),
            max_distance_cm,
        })
    }

    /// Read one distance in centimetres, surfacing errors
    pub fn try_read(&self) -> Result<f32> {
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        // Frames queue up between polls; only the newest one matters
        port.clear(serialport::ClearBuffer::Input)?;
        let mm = read_frame(&mut *port)?;
        Ok((mm as f32 / 10.0).min(self.max_distance_cm))
    }
}

impl DistanceSensor for SerialRangeFinder {
    fn read_distance(&self) -> f32 {
        match self.try_read() {
            Ok(cm) => {
                debug!("Range finder: {:.1}cm", cm);
                cm
            }
            Err(RangeFinderError::Timeout) => self.max_distance_cm,
            Err(e) => {
                warn!("Range finder read failed: {}", e);
                self.max_distance_cm
            }
        }
    }

    fn max_distance(&self) -> f32 {
        self.max_distance_cm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_checksum() {
        // 0xFF + 0x07 + 0xA1 = 0x1A7 -> 0xA7
        assert_eq!(checksum(&[0xFF, 0x07, 0xA1]), 0xA7);
    }

    #[test]
    fn test_read_frame() {
        let mut reader = Cursor::new(vec![0xFF, 0x07, 0xA1, 0xA7]);
        assert_eq!(read_frame(&mut reader).unwrap(), 1953);
    }

    #[test]
    fn test_read_frame_resyncs_on_header() {
        // Tail of a previous frame before the next header
        let mut reader = Cursor::new(vec![0x01, 0xA7, 0xFF, 0x00, 0xFA, 0xF9]);
        assert_eq!(read_frame(&mut reader).unwrap(), 250);
    }

    #[test]
    fn test_read_frame_rejects_bad_checksum() {
        let mut reader = Cursor::new(vec![0xFF, 0x07, 0xA1, 0x00]);
        assert!(matches!(
            read_frame(&mut reader),
            Err(RangeFinderError::ChecksumMismatch { expected: 0xA7, actual: 0x00 })
        ));
    }

    #[test]
    fn test_read_frame_gives_up_without_header() {
        let mut reader = Cursor::new(vec![0x10; 32]);
        assert!(matches!(
            read_frame(&mut reader),
            Err(RangeFinderError::NoHeader(MAX_SYNC_BYTES))
        ));
    }

    #[test]
    fn test_short_input_is_an_io_error() {
        let mut reader = Cursor::new(vec![0xFF, 0x07]);
        assert!(matches!(read_frame(&mut reader), Err(RangeFinderError::Io(_))));
    }
}
