//! Callback logging for controller traffic
//!
//! The register client reports every exchange through a [`CallbackLogger`].
//! In interpreted mode each request and reply is described by register
//! name, so a trace reads `write final_position@4 = 1600` instead of a
//! hex dump. Raw mode prints the RTU frame as it goes on the wire.

use std::sync::Arc;

use crate::codec;
use crate::protocol::{rtu, ModbusFunction, ModbusRequest, ModbusResponse};
use crate::registers::RegisterAddress;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// How exchanges are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// RTU frame hex only
    Raw,
    /// Register names and values
    Interpreted,
    /// Interpreted at the call level, raw at debug level
    Both,
}

/// Callback receiving a level and a rendered message
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that forwards to a user callback
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Logger printing timestamped lines to stdout/stderr
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Logger forwarding to the `log` facade, so env_logger filtering applies
    pub fn log_facade() -> Self {
        let callback: LogCallback = Box::new(|level, message| match level {
            LogLevel::Error => log::error!("{}", message),
            LogLevel::Warn => log::warn!("{}", message),
            LogLevel::Info => log::info!("{}", message),
            LogLevel::Debug => log::debug!("{}", message),
        });
        Self::new(Some(callback), LogLevel::Debug)
    }

    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Log an outgoing request
    pub fn log_request(&self, request: &ModbusRequest) {
        if !self.should_log(LogLevel::Info) && !self.should_log(LogLevel::Debug) {
            return;
        }
        let raw = || format!("Request -> Raw: {}", hex::encode_upper(rtu::encode_request(request)));
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&describe_request(request)),
            LoggingMode::Both => {
                self.info(&describe_request(request));
                self.debug(&raw());
            }
        }
    }

    /// Log the reply to `request`
    pub fn log_response(&self, request: &ModbusRequest, response: &ModbusResponse) {
        if !self.should_log(LogLevel::Info) && !self.should_log(LogLevel::Debug) {
            return;
        }
        let raw = || format!("Response <- Raw: {}", hex::encode_upper(rtu::encode_response(response)));
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&describe_response(request, response)),
            LoggingMode::Both => {
                self.info(&describe_response(request, response));
                self.debug(&raw());
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn register_label(offset: u16) -> String {
    match RegisterAddress::containing(offset) {
        Some(register) if register.offset() == offset => register.to_string(),
        Some(register) => format!("{}+{}", register, offset - register.offset()),
        None => format!("reserved@{}", offset),
    }
}

/// Fields covered by a range, each named once; unused offsets are skipped
fn range_label(start: u16, count: u16) -> String {
    let mut names: Vec<&'static str> = Vec::new();
    for offset in start..start.saturating_add(count) {
        if let Some(register) = RegisterAddress::containing(offset) {
            if names.last() != Some(&register.name()) {
                names.push(register.name());
            }
        }
    }
    names.join(", ")
}

fn describe_request(request: &ModbusRequest) -> String {
    match request.function {
        ModbusFunction::ReadHoldingRegisters => format!(
            "Request -> slave {}: read {} register(s) at {} [{}]",
            request.slave_id,
            request.quantity,
            request.address,
            range_label(request.address, request.quantity)
        ),
        ModbusFunction::WriteSingleRegister => format!(
            "Request -> slave {}: write {} = {}",
            request.slave_id,
            register_label(request.address),
            request.registers().first().copied().unwrap_or_default()
        ),
        ModbusFunction::WriteMultipleRegisters => format!(
            "Request -> slave {}: write {} [{}] = {:04X?}",
            request.slave_id,
            register_label(request.address),
            range_label(request.address, request.quantity),
            request.registers()
        ),
    }
}

fn describe_response(request: &ModbusRequest, response: &ModbusResponse) -> String {
    if let Some(error) = response.get_exception() {
        return format!("Response <- slave {}: {}", response.slave_id, error);
    }
    match response.function {
        ModbusFunction::ReadHoldingRegisters => match response.parse_registers() {
            Ok(registers) => format!(
                "Response <- slave {}: {} register(s) from {}: {}",
                response.slave_id,
                registers.len(),
                register_label(request.address),
                codec::registers_to_bytes(&registers)
                    .chunks(2)
                    .map(|pair| format!("{:02X}{:02X}", pair[0], pair[1]))
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            Err(e) => format!("Response <- slave {}: {}", response.slave_id, e),
        },
        ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
            match response.parse_echo() {
                Ok((address, word)) => format!(
                    "Response <- slave {}: write acknowledged at {} ({})",
                    response.slave_id,
                    register_label(address),
                    word
                ),
                Err(e) => format!("Response <- slave {}: {}", response.slave_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capturing(mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (CallbackLogger::with_mode(Some(callback), LogLevel::Debug, mode), lines)
    }

    #[test]
    fn test_level_filtering() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: LogCallback = Box::new(move |_, message| {
            sink.lock().unwrap().push(message.to_string());
        });
        let logger = CallbackLogger::new(Some(callback), LogLevel::Warn);
        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");
        assert_eq!(*lines.lock().unwrap(), vec!["e".to_string(), "w".to_string()]);

        assert!(!CallbackLogger::disabled().is_enabled());
    }

    #[test]
    fn test_interpreted_request_names_registers() {
        let (logger, lines) = capturing(LoggingMode::Interpreted);
        logger.log_request(&ModbusRequest::write_multiple(17, 4, &[0x0640, 0x0000]));
        logger.log_request(&ModbusRequest::read_holding(17, 0, 10));

        let lines = lines.lock().unwrap();
        assert!(lines[0].1.contains("final_position@4"));
        assert!(lines[1].1.contains("mode, current_position, final_position, spindle_position, encoder_position"));
    }

    #[test]
    fn test_response_and_raw_modes() {
        let (logger, lines) = capturing(LoggingMode::Both);
        let request = ModbusRequest::write_single(17, 0, 21);
        let response = ModbusResponse::write_echo(17, ModbusFunction::WriteSingleRegister, 0, 21);
        logger.log_response(&request, &response);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].1.contains("write acknowledged at mode@0"));
        assert_eq!(lines[1].0, LogLevel::Debug);
        assert!(lines[1].1.starts_with("Response <- Raw: 1106"));
    }

    #[test]
    fn test_exception_reply_is_described() {
        let (logger, lines) = capturing(LoggingMode::Interpreted);
        let request = ModbusRequest::write_single(17, 10, 1);
        let response = ModbusResponse::new_exception(17, ModbusFunction::WriteSingleRegister, 0x02);
        logger.log_request(&request);
        logger.log_response(&request, &response);

        let lines = lines.lock().unwrap();
        assert!(lines[0].1.contains("reserved@10"));
        assert!(lines[1].1.contains("Illegal Data Address"));
    }
}
