//! # Connection lifecycle
//!
//! [`ConnectionManager`] owns the transport and the [`ConnectionState`] that
//! describes it. It is the only place a serial handle is opened or dropped.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                  │
//!      └──────── failure ─────────┴──── failure ─────┘
//! ```
//!
//! A failed open or a failed exchange leaves the manager disconnected with a
//! retry scheduled `reconnect_delay` later. Nothing blocks while waiting:
//! callers ask [`ConnectionManager::maintain`] on every tick and the manager
//! only touches the port once the delay has passed. Configuration errors
//! follow the same schedule, so a bad port name never ends the process.
//!
//! After every successful connect one configuration upload is requested,
//! since the controller loses volatile settings on some faults.

use std::time::Duration;

use log::{error, info, warn};
use tokio::time::Instant;

use crate::client::RegisterClient;
use crate::config::{LinkConfig, PollConfig};
use crate::error::{RotaryError, RotaryResult};
use crate::logging::CallbackLogger;
use crate::transport::{ModbusTransport, RtuTransport};

/// Observable link health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Text of the most recent failure, cleared on reconnect
    pub last_error: Option<String>,
    /// Failures since the last successful connect
    pub consecutive_failures: u32,
}

/// Lifecycle phase of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Opens transports for the connection manager
pub trait Connector: Send + Sync + 'static {
    type Transport: ModbusTransport + 'static;

    fn open(&self, link: &LinkConfig) -> RotaryResult<Self::Transport>;
}

/// Connector for a real serial port
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Transport = RtuTransport;

    fn open(&self, link: &LinkConfig) -> RotaryResult<RtuTransport> {
        RtuTransport::open(link)
    }
}

/// Owner of the controller link
pub struct ConnectionManager<C: Connector> {
    connector: C,
    link: LinkConfig,
    reconnect_delay: Duration,
    client: Option<RegisterClient<C::Transport>>,
    state: ConnectionState,
    phase: LinkPhase,
    retry_at: Option<Instant>,
    upload_pending: bool,
    logger: Option<CallbackLogger>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a disconnected manager; no I/O happens until [`connect`](Self::connect)
    pub fn new(connector: C, link: LinkConfig, polling: &PollConfig) -> Self {
        Self {
            connector,
            link,
            reconnect_delay: polling.reconnect_delay(),
            client: None,
            state: ConnectionState::default(),
            phase: LinkPhase::Disconnected,
            retry_at: None,
            upload_pending: false,
            logger: None,
        }
    }

    /// Attach a traffic logger to every client this manager opens
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Open the link now
    ///
    /// On failure the error is recorded and the next attempt is scheduled
    /// one reconnect delay later; the error is also returned.
    pub fn connect(&mut self) -> RotaryResult<()> {
        self.phase = LinkPhase::Connecting;
        self.client = None;

        match self.connector.open(&self.link) {
            Ok(transport) => {
                let mut client =
                    RegisterClient::with_byte_order(transport, self.link.slave_id, self.link.byte_order);
                if let Some(ref logger) = self.logger {
                    client = client.with_logger(logger.clone());
                }
                self.client = Some(client);
                self.state = ConnectionState {
                    connected: true,
                    last_error: None,
                    consecutive_failures: 0,
                };
                self.phase = LinkPhase::Connected;
                self.retry_at = None;
                self.upload_pending = true;
                info!(
                    "Connected to controller {} on {} at {} baud",
                    self.link.slave_id, self.link.port, self.link.baud_rate
                );
                Ok(())
            }
            Err(e) => {
                if e.is_configuration() {
                    error!("Invalid link configuration: {}", e);
                }
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Record a failed exchange observed by a caller and drop the handle
    pub fn report_failure(&mut self, error: &RotaryError) {
        if self.client.take().is_some() {
            warn!("Lost controller link: {}", error);
        }
        self.record_failure(error);
    }

    fn record_failure(&mut self, error: &RotaryError) {
        self.state.connected = false;
        self.state.last_error = Some(error.to_string());
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.phase = LinkPhase::Disconnected;
        self.retry_at = Some(Instant::now() + self.reconnect_delay);
        warn!(
            "Controller link down ({} consecutive failures), retrying in {}s",
            self.state.consecutive_failures,
            self.reconnect_delay.as_secs_f32()
        );
    }

    /// Whether a connect attempt is allowed now
    pub fn reconnect_due(&self) -> bool {
        !self.state.connected && self.retry_at.map_or(true, |at| Instant::now() >= at)
    }

    /// Time left before the next attempt, zero when one is due
    pub fn time_until_retry(&self) -> Duration {
        match self.retry_at {
            Some(at) if !self.state.connected => at.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    /// Attempt a scheduled reconnect if one is due; returns the link state
    pub fn maintain(&mut self) -> bool {
        if self.reconnect_due() {
            // Failure is already recorded and rescheduled
            let _ = self.connect();
        }
        self.state.connected
    }

    /// Returns true once after each successful connect
    pub fn take_upload_request(&mut self) -> bool {
        std::mem::take(&mut self.upload_pending)
    }

    pub fn client_mut(&mut self) -> Option<&mut RegisterClient<C::Transport>> {
        self.client.as_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Drop the handle without counting a failure
    pub async fn close(&mut self) -> RotaryResult<()> {
        if let Some(mut client) = self.client.take() {
            client.transport_mut().close().await?;
        }
        self.state.connected = false;
        self.phase = LinkPhase::Disconnected;
        self.retry_at = None;
        info!("Closed controller link on {}", self.link.port);
        Ok(())
    }
}
