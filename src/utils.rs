/// Utility functions for the polling loop and diagnostics
///
/// Cycle timing metrics, argument validation and hex formatting.

use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::error::{RotaryError, RotaryResult};

/// Timing metrics for poll cycles
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
    pub last_duration: Duration,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cycle that produced a fresh snapshot
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_cycles += 1;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.record(duration);
    }

    /// Record a cycle that lost the link
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_cycles += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_cycles += 1;
        self.total_duration += duration;
        self.last_duration = duration;
        self.avg_duration = self.total_duration / self.total_cycles as u32;
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        (self.successful_cycles as f64 / self.total_cycles as f64) * 100.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            info!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Argument validation
pub mod validation {
    use super::*;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> RotaryResult<()> {
        if slave_id == 0 || slave_id > 247 {
            return Err(RotaryError::invalid_data(format!(
                "Invalid slave ID: {} (must be 1-247)",
                slave_id
            )));
        }
        Ok(())
    }

    /// Validate register count for one read
    pub fn validate_register_count(count: u16) -> RotaryResult<()> {
        if count == 0 || count > crate::protocol::MAX_REGISTERS_PER_READ {
            return Err(RotaryError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::protocol::MAX_REGISTERS_PER_READ
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format poll metrics as a table
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "Poll Metrics:\n\
             ├─ Total Cycles: {}\n\
             ├─ Successful: {} ({:.1}%)\n\
             ├─ Failed: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_cycles,
            metrics.successful_cycles,
            metrics.success_rate(),
            metrics.failed_cycles,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Logger setup helpers
pub mod logging {
    /// Initialize env_logger for tests; repeated calls are harmless
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_metrics() {
        let mut metrics = PerformanceMetrics::new();

        metrics.record_success(Duration::from_millis(10));
        metrics.record_success(Duration::from_millis(20));
        metrics.record_failure(Duration::from_millis(15));

        assert_eq!(metrics.total_cycles, 3);
        assert_eq!(metrics.successful_cycles, 2);
        assert_eq!(metrics.failed_cycles, 1);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(10)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(20)));
        assert_eq!(metrics.avg_duration, Duration::from_millis(15));
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);

        metrics.reset();
        assert_eq!(metrics.total_cycles, 0);
    }

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_id(1).is_ok());
        assert!(validation::validate_slave_id(247).is_ok());
        assert!(validation::validate_slave_id(0).is_err());
        assert!(validation::validate_slave_id(248).is_err());

        assert!(validation::validate_register_count(34).is_ok());
        assert!(validation::validate_register_count(0).is_err());
        assert!(validation::validate_register_count(126).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x07, 0x03, 0x10, 0xFF]), "07 03 10 FF");
        assert_eq!(format::registers_to_hex(&[0x1234, 0x5678]), "1234 5678");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(40)), "40ms");

        let table = format::format_metrics(&PerformanceMetrics::new());
        assert!(table.contains("Total Cycles: 0"));
    }
}
