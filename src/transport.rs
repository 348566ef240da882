//! # Serial Transport Layer
//!
//! One request/response exchange per call against the controller's serial
//! link. The link is half-duplex, so the transport never pipelines: it waits
//! for the inter-frame gap, sends the RTU frame, and reads the reply until
//! the line goes quiet. The whole exchange is bounded by the configured
//! timeout; a silent controller is a `Timeout` error, never a hang.
//!
//! Transports do not retry. Retry policy belongs to the connection manager.
//!
//! ```rust,no_run
//! use rotary_modbus::config::LinkConfig;
//! use rotary_modbus::protocol::ModbusRequest;
//! use rotary_modbus::transport::{ModbusTransport, RtuTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = LinkConfig::new("/dev/ttyUSB0", 57600, 17);
//!     let mut transport = RtuTransport::open(&link)?;
//!
//!     let response = transport.request(&ModbusRequest::read_holding(17, 0, 1)).await?;
//!     println!("Mode register: {:?}", response.parse_registers()?);
//!
//!     let stats = transport.get_stats();
//!     println!("Requests sent: {}", stats.requests_sent);
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::info;

use crate::config::{LinkConfig, Parity};
use crate::error::{RotaryError, RotaryResult};
use crate::protocol::{rtu, ModbusRequest, ModbusResponse, MAX_RTU_FRAME_SIZE};
use crate::utils::format::bytes_to_hex;

/// Log packet with direction
fn log_packet(direction: &str, data: &[u8], slave_id: u8) {
    info!("[MODBUS-RTU] {} slave:{} {}", direction, slave_id, bytes_to_hex(data));
}

/// Transport abstraction for one controller link
///
/// Implemented by the serial transport and by the simulated controller used
/// in tests.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Send a request and wait for its response
    ///
    /// # Errors
    ///
    /// - `RotaryError::Timeout` - no complete reply within the timeout
    /// - `RotaryError::Connection` - the serial handle is gone
    /// - `RotaryError::CrcMismatch` / `RotaryError::Frame` - corrupted reply
    /// - `RotaryError::Exception` - the controller rejected the request
    /// - `RotaryError::Protocol` - reply from the wrong slave
    async fn request(&mut self, request: &ModbusRequest) -> RotaryResult<ModbusResponse>;

    /// Whether the transport holds an open handle. Does not probe the device.
    fn is_connected(&self) -> bool;

    /// Release the handle
    async fn close(&mut self) -> RotaryResult<()>;

    /// Communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            return 0.0;
        }
        (self.responses_received as f64 / self.requests_sent as f64) * 100.0
    }
}

/// Minimum silent interval between RTU frames: 3.5 character times at
/// 11 bits per character
pub fn frame_gap(baud_rate: u32) -> Duration {
    let char_time_us = 11_000_000 / baud_rate.max(1) as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

fn serial_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn serial_data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn serial_stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

/// Modbus RTU transport over a serial port
#[derive(Debug)]
pub struct RtuTransport {
    port: Option<tokio_serial::SerialStream>,
    link: LinkConfig,
    timeout: Duration,
    frame_gap: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl RtuTransport {
    /// Open the serial port described by `link`
    pub fn open(link: &LinkConfig) -> RotaryResult<Self> {
        link.validate()?;

        let builder = tokio_serial::new(&link.port, link.baud_rate)
            .data_bits(serial_data_bits(link.data_bits))
            .stop_bits(serial_stop_bits(link.stop_bits))
            .parity(serial_parity(link.parity))
            .timeout(link.timeout());

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            RotaryError::connection(format!("Failed to open serial port {}: {}", link.port, e))
        })?;

        Ok(Self {
            port: Some(port),
            link: link.clone(),
            timeout: link.timeout(),
            frame_gap: frame_gap(link.baud_rate),
            stats: TransportStats::default(),
            packet_logging: link.packet_logging,
        })
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Read one RTU frame, ending when the line stays quiet for a frame gap
    async fn read_frame(&mut self) -> RotaryResult<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| RotaryError::connection("Serial port not connected"))?;

        let mut frame = Vec::new();
        let mut buffer = [0u8; 1];

        loop {
            match timeout(self.frame_gap, port.read_exact(&mut buffer)).await {
                Ok(Ok(_)) => {
                    frame.push(buffer[0]);
                    if frame.len() > MAX_RTU_FRAME_SIZE {
                        return Err(RotaryError::frame("RTU frame too large"));
                    }
                }
                Ok(Err(e)) => {
                    return Err(RotaryError::io(format!("Serial read error: {}", e)));
                }
                Err(_) => {
                    // Quiet line: end of frame once something arrived
                    if !frame.is_empty() {
                        break;
                    }
                }
            }
        }

        Ok(frame)
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn request(&mut self, request: &ModbusRequest) -> RotaryResult<ModbusResponse> {
        request.validate()?;

        tokio::time::sleep(self.frame_gap).await;

        let frame = rtu::encode_request(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            log_packet("send", &frame, request.slave_id);
        }

        let timeout_ms = self.timeout.as_millis() as u64;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| RotaryError::connection("Serial port not connected"))?;

        match timeout(self.timeout, port.write_all(&frame)).await {
            Ok(Ok(_)) => {
                let _ = timeout(self.timeout, port.flush()).await;
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(RotaryError::io(format!("Failed to send RTU frame: {}", e)));
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(RotaryError::timeout("send request", timeout_ms));
            }
        }

        let response_frame = match timeout(self.timeout, self.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(e);
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(RotaryError::timeout("read response", timeout_ms));
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_frame.len() as u64;

        if self.packet_logging {
            log_packet("receive", &response_frame, request.slave_id);
        }

        let response = rtu::decode_response(&response_frame).map_err(|e| {
            self.stats.errors += 1;
            e
        })?;

        if response.slave_id != request.slave_id {
            self.stats.errors += 1;
            return Err(RotaryError::protocol(format!(
                "Response slave ID mismatch: expected {}, got {}",
                request.slave_id, response.slave_id
            )));
        }

        if response.function != request.function {
            self.stats.errors += 1;
            return Err(RotaryError::protocol(format!(
                "Response function mismatch: expected {}, got {}",
                request.function, response.function
            )));
        }

        if let Some(error) = response.get_exception() {
            self.stats.errors += 1;
            return Err(error);
        }

        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> RotaryResult<()> {
        // SerialStream closes on drop
        self.port.take();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_gap() {
        // 57600 baud: 190us per character, 665us gap
        assert_eq!(frame_gap(57600), Duration::from_micros(665));
        assert_eq!(frame_gap(9600), Duration::from_micros(4007));
    }

    #[test]
    fn test_serial_parameter_mapping() {
        assert_eq!(serial_parity(Parity::Even), tokio_serial::Parity::Even);
        assert_eq!(serial_data_bits(7), tokio_serial::DataBits::Seven);
        assert_eq!(serial_stop_bits(2), tokio_serial::StopBits::Two);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut link = LinkConfig::new("/dev/ttyUSB0", 0, 17);
        assert!(RtuTransport::open(&link).unwrap_err().is_configuration());

        link.baud_rate = 57600;
        link.slave_id = 250;
        assert!(RtuTransport::open(&link).unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails_without_panicking() {
        let link = LinkConfig::new("/dev/does-not-exist-rotary", 57600, 17);
        let result = RtuTransport::open(&link);
        assert!(result.is_err());
    }

    #[test]
    fn test_stats_success_rate() {
        let stats = TransportStats {
            requests_sent: 4,
            responses_received: 3,
            ..TransportStats::default()
        };
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(TransportStats::default().success_rate(), 0.0);
    }
}
