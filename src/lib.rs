//! # Rotary Modbus - Communication Core for a Rotary Axis Controller
//!
//! Async client for a single stepper/rotary-axis controller on a half-duplex
//! Modbus RTU serial link. The controller exposes its state as a fixed
//! register file; this crate turns it into typed fields, keeps a polled
//! snapshot current, and survives link faults without taking the process
//! down.
//!
//! ## Features
//!
//! - **Typed register map**: positions as `i32`, speeds as `f32`, mode as an enum
//! - **Word-swapped 32-bit values**: the controller's little-swap layout, bit exact
//! - **Fail-soft facade**: link faults flag the connection down instead of erroring
//! - **Timed reconnect**: retries on a fixed delay, re-uploads configuration after
//! - **Adaptive polling**: fast cadence while healthy, slow while the link is dead
//! - **Simulated controller**: real RTU frames against an in-memory firmware model
//!
//! ## Function Codes Used
//!
//! | Code | Function |
//! |------|----------|
//! | 0x03 | Read Holding Registers |
//! | 0x10 | Write Multiple Registers (every field write, 16-bit included) |
//!
//! Write Single Register (0x06) is available as raw access only; the
//! controller firmware answers it with ILLEGAL FUNCTION.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rotary_modbus::config::ControllerConfig;
//! use rotary_modbus::connection::SerialConnector;
//! use rotary_modbus::device::Device;
//! use rotary_modbus::registers::Mode;
//!
//! #[tokio::main]
//! async fn main() -> rotary_modbus::RotaryResult<()> {
//!     let config = ControllerConfig::from_json_file("rotary.json")?;
//!     let device = Device::new(SerialConnector, &config);
//!     device.connect().await?;
//!
//!     if device.mode().await == Mode::Halt {
//!         device.set_current_position(0).await?;
//!     }
//!     device.move_to(90.0, &config.motion).await?;
//!     device.request_index().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐        ┌─────────────────┐
//! │  PollScheduler  │        │  User interface │
//! └─────────────────┘        └─────────────────┘
//!          │  snapshots (watch)       │  getters / setters
//!          └───────────┬──────────────┘
//!            ┌─────────────────┐
//!            │     Device      │  fail soft, guarded writes
//!            └─────────────────┘
//!            ┌─────────────────┐
//!            │ConnectionManager│  connect, failure, timed retry
//!            └─────────────────┘
//!            ┌─────────────────┐
//!            │ RegisterClient  │  typed single-exchange access
//!            └─────────────────┘
//!            ┌─────────────────┐
//!            │   Transport     │  RTU framing, CRC, timeout
//!            └─────────────────┘
//! ```

/// Error types and result handling
pub mod error;

/// Register value encoding and byte orders
pub mod codec;

/// Controller register map and operating modes
pub mod registers;

/// Modbus PDU definitions and RTU framing
pub mod protocol;

/// Serial transport layer
pub mod transport;

/// Typed register client
pub mod client;

/// Link, polling and motion configuration
pub mod config;

/// Connection lifecycle and reconnect scheduling
pub mod connection;

/// Device facade over the register map
pub mod device;

/// Periodic fast data polling
pub mod scheduler;

/// In-memory controller for tests and demos
pub mod simulator;

/// Utility functions and performance monitoring
pub mod utils;

/// Callback logging of controller traffic
pub mod logging;

// Re-export main types for convenience
pub use error::{RotaryError, RotaryResult};
pub use codec::{ByteOrder, RegisterValue, ValueKind};
pub use registers::{Intent, Mode, RegisterAddress};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse};
pub use transport::{ModbusTransport, RtuTransport, TransportStats};
pub use client::{ModbusClient, RegisterClient};
pub use config::{ControllerConfig, LinkConfig, MotionParameters, PollConfig, SynchroRatio};
pub use connection::{ConnectionManager, ConnectionState, Connector, LinkPhase, SerialConnector};
pub use device::Device;
pub use scheduler::{Cadence, FastDataSnapshot, PollScheduler, TickOutcome};
pub use simulator::SimulatedController;
pub use utils::{OperationTimer, PerformanceMetrics};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// Default controller slave address
pub const DEFAULT_SLAVE_ID: u8 = 17;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Rotary Modbus v{} - Modbus RTU client for rotary axis controllers", VERSION)
}
