/// In-memory rotary controller
///
/// `SimulatedController` stands in for the firmware on the other end of the
/// serial link. Requests are encoded to RTU frames, decoded on the
/// controller side, answered from a 34-register file and decoded again, so
/// the framing and CRC code paths run exactly as they do on hardware.
///
/// Clones share one register file; each clone is an independent handle that
/// can be opened and closed, like a serial port reopened after a fault.
///
/// Firmware behaviour reproduced:
/// - `IndexInit` settles to `Index`
/// - `SynchroInit` settles to `Synchro`, or to `SynchroBadRatio` when the
///   synchro denominator is zero
/// - `SetEncoder` copies the preset into the encoder position and settles to
///   `Halt`
/// - in `SynchroBadRatio` every mode request except `Halt` is ignored
/// - in `Index` the axis steps towards the final position on each exchange
/// - write single register (0x06) is not implemented and answers with
///   ILLEGAL FUNCTION; every write arrives as 0x10
///
/// Faults can be injected: failing the next N exchanges, going offline
/// (exchanges time out and opens are refused).

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;

use crate::codec::{ByteOrder, RegisterValue};
use crate::config::{LinkConfig, MotionParameters, SynchroRatio};
use crate::connection::Connector;
use crate::error::{RotaryError, RotaryResult};
use crate::protocol::{rtu, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::registers::{Mode, RegisterAddress, REGISTER_FILE_SIZE, RESERVED_OFFSETS};
use crate::transport::{ModbusTransport, TransportStats};

/// Steps travelled per exchange while indexing
const DEFAULT_STEP_PER_EXCHANGE: i32 = 40;

/// Timeout reported for injected failures
const SIMULATED_TIMEOUT_MS: u64 = 1000;

#[derive(Debug)]
struct ControllerState {
    registers: [u16; REGISTER_FILE_SIZE as usize],
    order: ByteOrder,
    fail_next: u32,
    offline: bool,
    hold_transients: bool,
    step_per_exchange: i32,
    open_attempts: u32,
    requests: u64,
    reads: Vec<(u16, u16)>,
    writes: Vec<(u16, Vec<u16>)>,
    stats: TransportStats,
}

impl ControllerState {
    fn new() -> Self {
        let mut state = Self {
            registers: [0; REGISTER_FILE_SIZE as usize],
            order: ByteOrder::LittleSwap,
            fail_next: 0,
            offline: false,
            hold_transients: false,
            step_per_exchange: DEFAULT_STEP_PER_EXCHANGE,
            open_attempts: 0,
            requests: 0,
            reads: Vec::new(),
            writes: Vec::new(),
            stats: TransportStats::default(),
        };

        let motion = MotionParameters::default();
        let synchro = SynchroRatio::default();
        state.store(RegisterAddress::MaxSpeed, RegisterValue::F32(motion.max_speed));
        state.store(RegisterAddress::MinSpeed, RegisterValue::F32(motion.min_speed));
        state.store(RegisterAddress::Acceleration, RegisterValue::F32(motion.acceleration));
        state.store(RegisterAddress::RatioNum, RegisterValue::I32(motion.ratio_num));
        state.store(RegisterAddress::RatioDen, RegisterValue::I32(motion.ratio_den));
        state.store(RegisterAddress::SynRatioNum, RegisterValue::I32(synchro.num));
        state.store(RegisterAddress::SynRatioDen, RegisterValue::I32(synchro.den));
        state
    }

    fn load(&self, register: RegisterAddress) -> RegisterValue {
        let start = register.offset() as usize;
        let end = start + register.kind().register_count() as usize;
        RegisterValue::from_registers(register.kind(), &self.registers[start..end], self.order)
    }

    fn store(&mut self, register: RegisterAddress, value: RegisterValue) {
        let start = register.offset() as usize;
        for (i, word) in value.to_registers(self.order).into_iter().enumerate() {
            self.registers[start + i] = word;
        }
    }

    fn mode_code(&self) -> u16 {
        self.registers[RegisterAddress::Mode.offset() as usize]
    }

    fn set_mode(&mut self, mode: Mode) {
        self.registers[RegisterAddress::Mode.offset() as usize] = mode.code();
    }

    /// Handle one RTU request frame, returning the reply frame
    fn exchange(&mut self, slave_id: SlaveId, frame: &[u8]) -> RotaryResult<Vec<u8>> {
        self.requests += 1;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.offline {
            self.stats.timeouts += 1;
            self.stats.errors += 1;
            return Err(RotaryError::timeout("read response", SIMULATED_TIMEOUT_MS));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.stats.timeouts += 1;
            self.stats.errors += 1;
            return Err(RotaryError::timeout("read response", SIMULATED_TIMEOUT_MS));
        }

        let request = rtu::decode_request(frame)?;
        if request.slave_id != slave_id {
            // Another slave's frame: the line stays silent
            self.stats.timeouts += 1;
            self.stats.errors += 1;
            return Err(RotaryError::timeout("read response", SIMULATED_TIMEOUT_MS));
        }

        let response = self.process(&request);
        self.advance_motion();

        let reply = rtu::encode_response(&response);
        self.stats.responses_received += 1;
        self.stats.bytes_received += reply.len() as u64;
        Ok(reply)
    }

    fn process(&mut self, request: &ModbusRequest) -> ModbusResponse {
        let start = request.address;
        let end = start as u32 + request.quantity as u32;
        let illegal_address =
            ModbusResponse::new_exception(request.slave_id, request.function, 0x02);

        if request.function == ModbusFunction::WriteSingleRegister {
            debug!("simulator: rejecting function 0x06 at {}", start);
            return ModbusResponse::new_exception(request.slave_id, request.function, 0x01);
        }
        if end > REGISTER_FILE_SIZE as u32 {
            return illegal_address;
        }

        match request.function {
            ModbusFunction::ReadHoldingRegisters => {
                self.reads.push((start, request.quantity));
                let registers = &self.registers[start as usize..end as usize];
                ModbusResponse::registers_read(request.slave_id, registers)
            }
            ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
                if RESERVED_OFFSETS
                    .iter()
                    .any(|&r| r >= start && (r as u32) < end)
                {
                    return illegal_address;
                }

                let values = request.registers();
                self.writes.push((start, values.clone()));
                for (i, value) in values.iter().enumerate() {
                    self.write_word(start + i as u16, *value);
                }

                ModbusResponse::write_echo(request.slave_id, request.function, start, request.quantity)
            }
        }
    }

    fn write_word(&mut self, offset: u16, value: u16) {
        if offset != RegisterAddress::Mode.offset() {
            self.registers[offset as usize] = value;
            return;
        }

        // A fault is cleared only by an explicit halt request
        if self.mode_code() == Mode::SynchroBadRatio.code() && value != Mode::Halt.code() {
            debug!("simulator: ignoring mode {} while in synchro fault", value);
            return;
        }

        self.registers[offset as usize] = value;
        if value == Mode::Halt.code() {
            self.store(RegisterAddress::CurrentSpeed, RegisterValue::F32(0.0));
        }
        if !self.hold_transients {
            self.settle();
        }
    }

    /// Resolve a transient request mode the way the firmware does
    fn settle(&mut self) {
        let mode = match Mode::from_code(self.mode_code()) {
            Ok(mode) => mode,
            Err(_) => return,
        };
        match mode {
            Mode::IndexInit => self.set_mode(Mode::Index),
            Mode::SynchroInit => {
                if self.load(RegisterAddress::SynRatioDen).as_i32() == 0 {
                    self.set_mode(Mode::SynchroBadRatio);
                } else {
                    self.set_mode(Mode::Synchro);
                }
            }
            Mode::SetEncoder => {
                let preset = self.load(RegisterAddress::EncoderPresetValue);
                self.store(RegisterAddress::EncoderPosition, preset);
                self.set_mode(Mode::Halt);
            }
            _ => {}
        }
    }

    fn advance_motion(&mut self) {
        if self.mode_code() != Mode::Index.code() {
            return;
        }
        let current = self.load(RegisterAddress::CurrentPosition).as_i32();
        let target = self.load(RegisterAddress::FinalPosition).as_i32();
        let remaining = target.saturating_sub(current);
        let step = remaining.clamp(-self.step_per_exchange, self.step_per_exchange);

        let speed = if step == 0 {
            0.0
        } else {
            self.load(RegisterAddress::MaxSpeed).as_f32()
        };
        self.store(RegisterAddress::CurrentPosition, RegisterValue::I32(current + step));
        self.store(RegisterAddress::CurrentSpeed, RegisterValue::F32(speed));
    }
}

/// Simulated controller speaking RTU frames in memory
#[derive(Debug, Clone)]
pub struct SimulatedController {
    slave_id: SlaveId,
    state: Arc<Mutex<ControllerState>>,
    connected: bool,
}

impl SimulatedController {
    /// Controller answering at `slave_id`, halted, with default motion
    /// parameters loaded
    pub fn new(slave_id: SlaveId) -> Self {
        Self {
            slave_id,
            state: Arc::new(Mutex::new(ControllerState::new())),
            connected: true,
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    /// Raw register content
    pub fn register(&self, offset: u16) -> u16 {
        self.state().registers[offset as usize]
    }

    pub fn registers(&self) -> Vec<u16> {
        self.state().registers.to_vec()
    }

    pub fn value(&self, register: RegisterAddress) -> RegisterValue {
        self.state().load(register)
    }

    /// Set a field directly, bypassing the firmware rules
    pub fn set_value(&self, register: RegisterAddress, value: RegisterValue) {
        self.state().store(register, value);
    }

    pub fn mode(&self) -> Mode {
        Mode::from_wire(self.state().mode_code())
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state().set_mode(mode);
    }

    /// Store an arbitrary mode code, including ones the client does not know
    pub fn set_mode_code(&self, code: u16) {
        self.state().registers[RegisterAddress::Mode.offset() as usize] = code;
    }

    /// Keep `IndexInit`, `SynchroInit` and `SetEncoder` until [`settle`](Self::settle)
    pub fn hold_transients(&self, hold: bool) {
        self.state().hold_transients = hold;
    }

    /// Resolve a held transient mode
    pub fn settle(&self) {
        self.state().settle();
    }

    pub fn set_step_per_exchange(&self, steps: i32) {
        self.state().step_per_exchange = steps.max(0);
    }

    /// Fail the next `count` exchanges with a timeout
    pub fn fail_next(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Take the controller off the line: exchanges time out, opens fail
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn is_offline(&self) -> bool {
        self.state().offline
    }

    /// Number of times a connector tried to open this controller
    pub fn open_attempts(&self) -> u32 {
        self.state().open_attempts
    }

    /// Exchanges that reached the controller, failed ones included
    pub fn request_count(&self) -> u64 {
        self.state().requests
    }

    /// Reads whose range covered `register`
    pub fn read_count(&self, register: RegisterAddress) -> usize {
        let offset = register.offset();
        self.state()
            .reads
            .iter()
            .filter(|(start, quantity)| offset >= *start && offset < start + quantity)
            .count()
    }

    /// Writes starting at `register`
    pub fn write_count(&self, register: RegisterAddress) -> usize {
        let offset = register.offset();
        self.state().writes.iter().filter(|(start, _)| *start == offset).count()
    }

    pub fn total_writes(&self) -> usize {
        self.state().writes.len()
    }

    /// Every accepted write in arrival order
    pub fn write_log(&self) -> Vec<(u16, Vec<u16>)> {
        self.state().writes.clone()
    }

    /// Forget recorded reads and writes
    pub fn clear_history(&self) {
        let mut state = self.state();
        state.reads.clear();
        state.writes.clear();
        state.requests = 0;
    }
}

#[async_trait]
impl ModbusTransport for SimulatedController {
    async fn request(&mut self, request: &ModbusRequest) -> RotaryResult<ModbusResponse> {
        if !self.connected {
            return Err(RotaryError::connection("Simulated port not connected"));
        }
        request.validate()?;

        let frame = rtu::encode_request(request);
        let reply = self.state().exchange(self.slave_id, &frame)?;
        let response = rtu::decode_response(&reply)?;

        if let Some(error) = response.get_exception() {
            self.state().stats.errors += 1;
            return Err(error);
        }
        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> RotaryResult<()> {
        self.connected = false;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.state().stats.clone()
    }
}

impl Connector for SimulatedController {
    type Transport = SimulatedController;

    fn open(&self, link: &LinkConfig) -> RotaryResult<Self::Transport> {
        let mut state = self.state();
        state.open_attempts += 1;
        link.validate()?;
        if state.offline {
            return Err(RotaryError::connection(format!(
                "Failed to open serial port {}: no such device",
                link.port
            )));
        }
        drop(state);

        Ok(Self {
            slave_id: self.slave_id,
            state: Arc::clone(&self.state),
            connected: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_firmware_mode_rules() {
        let mut controller = SimulatedController::new(17);

        controller.request(&ModbusRequest::write_multiple(17, 0, &[Mode::IndexInit.code()])).await.unwrap();
        assert_eq!(controller.mode(), Mode::Index);

        controller.set_value(RegisterAddress::SynRatioDen, RegisterValue::I32(0));
        controller.request(&ModbusRequest::write_multiple(17, 0, &[Mode::SynchroInit.code()])).await.unwrap();
        assert_eq!(controller.mode(), Mode::SynchroBadRatio);

        // Only a halt request leaves the fault
        controller.request(&ModbusRequest::write_multiple(17, 0, &[Mode::IndexInit.code()])).await.unwrap();
        assert_eq!(controller.mode(), Mode::SynchroBadRatio);
        controller.request(&ModbusRequest::write_multiple(17, 0, &[Mode::Halt.code()])).await.unwrap();
        assert_eq!(controller.mode(), Mode::Halt);
    }

    #[tokio::test]
    async fn test_encoder_preset_latch() {
        let mut controller = SimulatedController::new(17);
        controller.set_value(RegisterAddress::EncoderPresetValue, RegisterValue::I32(-250));
        controller.request(&ModbusRequest::write_multiple(17, 0, &[Mode::SetEncoder.code()])).await.unwrap();

        assert_eq!(controller.value(RegisterAddress::EncoderPosition), RegisterValue::I32(-250));
        assert_eq!(controller.mode(), Mode::Halt);
    }

    #[tokio::test]
    async fn test_held_transient() {
        let mut controller = SimulatedController::new(17);
        controller.hold_transients(true);
        controller.request(&ModbusRequest::write_multiple(17, 0, &[Mode::SynchroInit.code()])).await.unwrap();
        assert_eq!(controller.mode(), Mode::SynchroInit);
        controller.settle();
        assert_eq!(controller.mode(), Mode::Synchro);
    }

    #[tokio::test]
    async fn test_indexing_moves_towards_target() {
        let mut controller = SimulatedController::new(17);
        controller.set_step_per_exchange(100);
        controller.set_value(RegisterAddress::FinalPosition, RegisterValue::I32(250));
        controller.set_mode(Mode::Index);

        let read = ModbusRequest::read_holding(17, 0, 4);
        for _ in 0..2 {
            controller.request(&read).await.unwrap();
        }
        assert_eq!(controller.value(RegisterAddress::CurrentPosition), RegisterValue::I32(200));
        assert_eq!(controller.value(RegisterAddress::CurrentSpeed), RegisterValue::F32(3600.0));

        for _ in 0..2 {
            controller.request(&read).await.unwrap();
        }
        assert_eq!(controller.value(RegisterAddress::CurrentPosition), RegisterValue::I32(250));
        assert_eq!(controller.value(RegisterAddress::CurrentSpeed), RegisterValue::F32(0.0));
    }

    #[tokio::test]
    async fn test_exceptions_and_faults() {
        let mut controller = SimulatedController::new(17);

        let err = controller.request(&ModbusRequest::write_multiple(17, 10, &[1])).await.unwrap_err();
        assert!(matches!(err, RotaryError::Exception { code: 0x02, .. }));
        let err = controller.request(&ModbusRequest::write_single(17, 0, 0)).await.unwrap_err();
        assert!(matches!(err, RotaryError::Exception { code: 0x01, .. }));
        assert_eq!(controller.total_writes(), 0);
        let err = controller.request(&ModbusRequest::read_holding(17, 30, 8)).await.unwrap_err();
        assert!(matches!(err, RotaryError::Exception { code: 0x02, .. }));

        // Wrong slave: silence
        let err = controller.request(&ModbusRequest::read_holding(7, 0, 1)).await.unwrap_err();
        assert!(matches!(err, RotaryError::Timeout { .. }));

        controller.fail_next(2);
        assert!(controller.request(&ModbusRequest::read_holding(17, 0, 1)).await.is_err());
        assert!(controller.request(&ModbusRequest::read_holding(17, 0, 1)).await.is_err());
        assert!(controller.request(&ModbusRequest::read_holding(17, 0, 1)).await.is_ok());

        controller.close().await.unwrap();
        let err = controller.request(&ModbusRequest::read_holding(17, 0, 1)).await.unwrap_err();
        assert!(matches!(err, RotaryError::Connection { .. }));
    }

    #[test]
    fn test_connector_open() {
        let controller = SimulatedController::new(17);
        let link = LinkConfig::new("sim", 57600, 17);

        let handle = controller.open(&link).unwrap();
        assert!(handle.is_connected());

        controller.set_offline(true);
        assert!(controller.open(&link).is_err());
        assert!(controller.open(&LinkConfig::new("sim", 0, 17)).unwrap_err().is_configuration());
        assert_eq!(controller.open_attempts(), 3);
    }

    #[test]
    fn test_default_register_file() {
        let controller = SimulatedController::new(17);
        assert_eq!(controller.mode(), Mode::Halt);
        assert_eq!(controller.value(RegisterAddress::MaxSpeed), RegisterValue::F32(3600.0));
        assert_eq!(controller.value(RegisterAddress::SynRatioDen), RegisterValue::I32(36000));
        // 3600.0f32 = 0x45610000, low word first
        assert_eq!(controller.register(16), 0x0000);
        assert_eq!(controller.register(17), 0x4561);
    }
}
