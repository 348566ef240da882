//! # Poll scheduler
//!
//! [`PollScheduler`] keeps a [`FastDataSnapshot`] of the controller current.
//! Each tick it lets the connection manager reconnect if a retry is due,
//! pushes the held configuration after every fresh connect, and reads the
//! fast data block in one exchange.
//!
//! Snapshots are immutable. Every successful poll publishes a new one through
//! a `tokio::sync::watch` channel; a failed poll publishes the last-known
//! values with the mode replaced by `Disconnected`, so consumers keep showing
//! stale data with a visible disconnected indication.
//!
//! The cadence is fast while the link is healthy and widens once failures
//! accumulate, so a dead link is not flooded with requests.
//!
//! ```rust,no_run
//! use rotary_modbus::config::ControllerConfig;
//! use rotary_modbus::connection::SerialConnector;
//! use rotary_modbus::device::Device;
//! use rotary_modbus::scheduler::PollScheduler;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ControllerConfig::default();
//!     let device = Device::new(SerialConnector, &config);
//!     let scheduler = PollScheduler::new(device.clone(), config.polling.clone());
//!     let mut snapshots = scheduler.subscribe();
//!
//!     let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//!     let task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));
//!
//!     while snapshots.changed().await.is_ok() {
//!         let snapshot = snapshots.borrow().clone();
//!         println!("{} at {}", snapshot.mode, snapshot.current_position);
//!     }
//!     let _ = shutdown_tx.send(());
//!     let _ = task.await;
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::config::PollConfig;
use crate::connection::Connector;
use crate::device::{Device, FastReadings};
use crate::registers::Mode;
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Point-in-time copy of the fast-changing controller state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FastDataSnapshot {
    pub mode: Mode,
    pub current_position: i32,
    pub final_position: i32,
    pub current_speed: f32,
    pub encoder_position: i32,
    /// Completed polls since the scheduler started
    pub cycle_count: u64,
    /// Duration of the poll exchange that produced this snapshot
    pub execution_interval_micros: u64,
    pub captured_at: DateTime<Utc>,
}

impl FastDataSnapshot {
    /// Snapshot shown before the first successful poll
    pub fn disconnected() -> Self {
        Self {
            mode: Mode::Disconnected,
            current_position: 0,
            final_position: 0,
            current_speed: 0.0,
            encoder_position: 0,
            cycle_count: 0,
            execution_interval_micros: 0,
            captured_at: Utc::now(),
        }
    }

    fn from_readings(readings: FastReadings, cycle_count: u64, elapsed: Duration) -> Self {
        Self {
            mode: readings.mode,
            current_position: readings.current_position,
            final_position: readings.final_position,
            current_speed: readings.current_speed,
            encoder_position: readings.encoder_position,
            cycle_count,
            execution_interval_micros: elapsed.as_micros() as u64,
            captured_at: Utc::now(),
        }
    }

    /// Last-known values flagged as disconnected
    fn stale(&self) -> Self {
        Self {
            mode: Mode::Disconnected,
            captured_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.mode != Mode::Disconnected
    }
}

/// Poll rate selected from link health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Fast,
    Slow,
}

/// Result of one scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A fresh snapshot was published
    Polled,
    /// The poll exchange failed and the link was flagged down
    Failed,
    /// The link was down and no exchange was attempted
    Offline,
}

/// Periodic refresher of the fast data snapshot
pub struct PollScheduler<C: Connector> {
    device: Device<C>,
    config: PollConfig,
    cadence: Cadence,
    cycle_count: u64,
    metrics: PerformanceMetrics,
    snapshot_tx: watch::Sender<FastDataSnapshot>,
}

impl<C: Connector> PollScheduler<C> {
    pub fn new(device: Device<C>, config: PollConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(FastDataSnapshot::disconnected());
        Self {
            device,
            config,
            cadence: Cadence::Fast,
            cycle_count: 0,
            metrics: PerformanceMetrics::new(),
            snapshot_tx,
        }
    }

    /// Receiver of every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<FastDataSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Most recently published snapshot
    pub fn snapshot(&self) -> FastDataSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Delay before the next tick
    pub fn interval(&self) -> Duration {
        match self.cadence {
            Cadence::Fast => self.config.fast_interval(),
            Cadence::Slow => self.config.slow_interval(),
        }
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn device(&self) -> &Device<C> {
        &self.device
    }

    /// Run one poll cycle
    pub async fn tick(&mut self) -> TickOutcome {
        if !self.device.maintain().await {
            self.publish_stale();
            self.update_cadence().await;
            return TickOutcome::Offline;
        }

        if self.device.take_upload_request().await {
            // Link failures are absorbed and flag the link down; anything
            // returned here is a rejected setting
            if let Err(e) = self.device.reupload().await {
                error!("Configuration upload rejected: {}", e);
            }
        }

        let timer = OperationTimer::start("fast data poll");
        let outcome = match self.device.poll_fast_data().await {
            Some(readings) => {
                let elapsed = timer.stop();
                self.cycle_count += 1;
                self.metrics.record_success(elapsed);
                self.snapshot_tx
                    .send_replace(FastDataSnapshot::from_readings(readings, self.cycle_count, elapsed));
                TickOutcome::Polled
            }
            None => {
                self.metrics.record_failure(timer.stop());
                self.publish_stale();
                TickOutcome::Failed
            }
        };

        self.update_cadence().await;
        outcome
    }

    fn publish_stale(&self) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.is_connected() {
                *snapshot = snapshot.stale();
                true
            } else {
                false
            }
        });
    }

    async fn update_cadence(&mut self) {
        let state = self.device.connection_state().await;
        let cadence = if !state.connected && state.consecutive_failures >= self.config.degrade_after_failures {
            Cadence::Slow
        } else {
            Cadence::Fast
        };
        if cadence != self.cadence {
            info!("Poll cadence {:?} -> {:?}", self.cadence, cadence);
            self.cadence = cadence;
        }
    }

    /// Tick until a shutdown signal arrives, returning the cycle metrics
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> PerformanceMetrics {
        info!(
            "Poll scheduler started: fast {:?}, slow {:?}",
            self.config.fast_interval(),
            self.config.slow_interval()
        );
        loop {
            let outcome = self.tick().await;
            debug!("tick: {:?}, next in {:?}", outcome, self.interval());

            tokio::select! {
                _ = tokio::time::sleep(self.interval()) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping poll scheduler");
                    break;
                }
            }
        }
        self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RegisterValue;
    use crate::config::ControllerConfig;
    use crate::registers::RegisterAddress;
    use crate::simulator::SimulatedController;

    fn scheduler(controller: &SimulatedController) -> PollScheduler<SimulatedController> {
        let config = ControllerConfig::default();
        PollScheduler::new(Device::new(controller.clone(), &config), config.polling)
    }

    #[tokio::test]
    async fn test_first_tick_connects_uploads_and_polls() {
        let controller = SimulatedController::new(17);
        controller.set_value(RegisterAddress::MaxSpeed, RegisterValue::F32(1.0));
        controller.set_value(RegisterAddress::CurrentPosition, RegisterValue::I32(321));
        let mut scheduler = scheduler(&controller);

        assert_eq!(scheduler.tick().await, TickOutcome::Polled);
        assert_eq!(controller.open_attempts(), 1);
        assert_eq!(controller.value(RegisterAddress::MaxSpeed), RegisterValue::F32(3600.0));

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.mode, Mode::Halt);
        assert_eq!(snapshot.current_position, 321);
        assert_eq!(snapshot.cycle_count, 1);

        let writes = controller.total_writes();
        assert_eq!(scheduler.tick().await, TickOutcome::Polled);
        assert_eq!(controller.total_writes(), writes);
        assert_eq!(scheduler.snapshot().cycle_count, 2);
    }

    #[tokio::test]
    async fn test_failed_poll_publishes_stale_snapshot() {
        let controller = SimulatedController::new(17);
        controller.set_value(RegisterAddress::EncoderPosition, RegisterValue::I32(-9));
        let mut scheduler = scheduler(&controller);
        let mut rx = scheduler.subscribe();

        scheduler.tick().await;
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        controller.fail_next(1);
        assert_eq!(scheduler.tick().await, TickOutcome::Failed);
        let stale = rx.borrow_and_update().clone();
        assert_eq!(stale.mode, Mode::Disconnected);
        assert_eq!(stale.encoder_position, -9);
        assert_eq!(stale.cycle_count, 1);

        // Already disconnected: nothing new to publish
        assert_eq!(scheduler.tick().await, TickOutcome::Offline);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(scheduler.metrics().failed_cycles, 1);
    }

    /// Transport whose writes fail with a contract error, not a link error
    struct RejectingWrites(SimulatedController);

    #[async_trait::async_trait]
    impl crate::transport::ModbusTransport for RejectingWrites {
        async fn request(
            &mut self,
            request: &crate::protocol::ModbusRequest,
        ) -> crate::error::RotaryResult<crate::protocol::ModbusResponse> {
            if request.function.is_write_function() {
                return Err(crate::error::RotaryError::invalid_data("value out of range"));
            }
            self.0.request(request).await
        }

        fn is_connected(&self) -> bool {
            self.0.is_connected()
        }

        async fn close(&mut self) -> crate::error::RotaryResult<()> {
            self.0.close().await
        }

        fn get_stats(&self) -> crate::transport::TransportStats {
            self.0.get_stats()
        }
    }

    struct RejectingConnector(SimulatedController);

    impl Connector for RejectingConnector {
        type Transport = RejectingWrites;

        fn open(&self, link: &crate::config::LinkConfig) -> crate::error::RotaryResult<RejectingWrites> {
            Ok(RejectingWrites(self.0.open(link)?))
        }
    }

    #[tokio::test]
    async fn test_rejected_upload_is_reported_and_polling_continues() {
        crate::utils::logging::init_test_logger();
        let controller = SimulatedController::new(17);
        let config = ControllerConfig::default();
        let device = Device::new(RejectingConnector(controller.clone()), &config);
        let mut scheduler = PollScheduler::new(device.clone(), config.polling);

        assert_eq!(scheduler.tick().await, TickOutcome::Polled);
        assert!(device.is_connected().await);
        assert_eq!(controller.total_writes(), 0);
        assert_eq!(scheduler.snapshot().mode, Mode::Halt);
        assert!(device.reupload().await.unwrap_err().to_string().contains("out of range"));
    }

    #[tokio::test]
    async fn test_unknown_mode_is_not_reported_as_disconnected() {
        let controller = SimulatedController::new(17);
        let mut scheduler = scheduler(&controller);
        let mut rx = scheduler.subscribe();
        controller.set_mode_code(7);

        assert_eq!(scheduler.tick().await, TickOutcome::Polled);
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.mode, Mode::Unknown(7));
        assert!(snapshot.is_connected());

        // The next outage is still published
        controller.fail_next(1);
        assert_eq!(scheduler.tick().await, TickOutcome::Failed);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().mode, Mode::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_widens_and_recovers() {
        let controller = SimulatedController::new(17);
        let mut scheduler = scheduler(&controller);
        scheduler.tick().await;
        assert_eq!(scheduler.interval(), Duration::from_millis(40));

        controller.set_offline(true);
        assert_eq!(scheduler.tick().await, TickOutcome::Failed);
        assert_eq!(scheduler.cadence(), Cadence::Fast);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(scheduler.tick().await, TickOutcome::Offline);
        assert_eq!(scheduler.cadence(), Cadence::Slow);
        assert_eq!(scheduler.interval(), Duration::from_millis(500));

        controller.set_offline(false);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(scheduler.tick().await, TickOutcome::Polled);
        assert_eq!(scheduler.cadence(), Cadence::Fast);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let controller = SimulatedController::new(17);
        let scheduler = scheduler(&controller);
        let mut rx = scheduler.subscribe();
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().mode, Mode::Halt);
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown_tx.send(()).unwrap();
        let metrics = task.await.unwrap();
        assert!(metrics.successful_cycles >= 2);
    }
}
