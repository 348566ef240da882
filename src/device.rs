//! # Device facade
//!
//! [`Device`] maps the controller's named quantities onto the register map.
//! Each getter is one read and each setter one write, with two policies
//! applied in a single place:
//!
//! - **Fail soft.** A link failure never reaches the caller. The connection
//!   is flagged disconnected with the error text kept, getters return zero
//!   (or [`Mode::Disconnected`]) and setters return `Ok(())`. While the link
//!   is down calls short-circuit without touching the port.
//! - **Refuse early.** Requests that make no sense in the last-read mode fail
//!   with `RotaryError::Precondition` before any I/O. The only hard rule is
//!   the current-position write, which needs a halted axis.
//!
//! `Device` is a cheap clonable handle. All clones share one lock around the
//! connection, so setters from a user interface are serialised with poll
//! ticks and only one exchange is ever in flight.
//!
//! ```rust
//! use rotary_modbus::config::ControllerConfig;
//! use rotary_modbus::device::Device;
//! use rotary_modbus::registers::Mode;
//! use rotary_modbus::simulator::SimulatedController;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let controller = SimulatedController::new(17);
//! let device = Device::new(controller, &ControllerConfig::default());
//! device.connect().await.unwrap();
//!
//! assert_eq!(device.mode().await, Mode::Halt);
//! device.set_current_position(0).await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::codec::RegisterValue;
use crate::config::{ControllerConfig, MotionParameters, SynchroRatio};
use crate::connection::{ConnectionManager, ConnectionState, Connector};
use crate::error::{RotaryError, RotaryResult};
use crate::logging::CallbackLogger;
use crate::registers::{Intent, Mode, RegisterAddress};

/// Fields refreshed on every poll, read as one block starting at offset 0
pub const FAST_DATA_FIELDS: [RegisterAddress; 5] = [
    RegisterAddress::Mode,
    RegisterAddress::CurrentPosition,
    RegisterAddress::FinalPosition,
    RegisterAddress::EncoderPosition,
    RegisterAddress::CurrentSpeed,
];

/// Values read by one fast poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastReadings {
    pub mode: Mode,
    pub current_position: i32,
    pub final_position: i32,
    pub encoder_position: i32,
    pub current_speed: f32,
}

struct Shared<C: Connector> {
    connection: ConnectionManager<C>,
    last_mode: Mode,
    motion: MotionParameters,
    synchro: SynchroRatio,
}

impl<C: Connector> Shared<C> {
    fn absorb(&mut self, context: &str, error: RotaryError) {
        if error.is_link_failure() {
            warn!("{} failed: {}", context, error);
            self.connection.report_failure(&error);
            self.last_mode = Mode::Disconnected;
        } else {
            warn!("{}: {}", context, error);
        }
    }

    /// Read one field, falling back to zero
    async fn read(&mut self, register: RegisterAddress) -> RegisterValue {
        let fallback = RegisterValue::zero(register.kind());
        let Some(client) = self.connection.client_mut() else {
            debug!("read {} skipped: link down", register);
            return fallback;
        };
        match client.read_value(register).await {
            Ok(value) => value,
            Err(e) => {
                self.absorb(&format!("read {}", register), e);
                fallback
            }
        }
    }

    /// Write one field; link failures are absorbed, other errors returned
    async fn write(&mut self, register: RegisterAddress, value: RegisterValue) -> RotaryResult<()> {
        let Some(client) = self.connection.client_mut() else {
            debug!("write {} = {} dropped: link down", register, value);
            return Ok(());
        };
        match client.write_value(register, value).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_link_failure() => {
                self.absorb(&format!("write {} = {}", register, value), e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_mode(&mut self) -> Mode {
        if !self.connection.is_connected() {
            self.last_mode = Mode::Disconnected;
            return Mode::Disconnected;
        }
        let code = self.read(RegisterAddress::Mode).await.as_u16();
        if !self.connection.is_connected() {
            return Mode::Disconnected;
        }
        self.last_mode = decode_mode(code);
        self.last_mode
    }

    async fn write_mode(&mut self, mode: Mode) -> RotaryResult<()> {
        if !mode.is_transmittable() {
            return Err(RotaryError::invalid_data(format!(
                "{} is not a mode the controller accepts",
                mode
            )));
        }
        self.write(RegisterAddress::Mode, RegisterValue::U16(mode.code())).await
    }

    async fn write_motion(&mut self, motion: &MotionParameters) -> RotaryResult<()> {
        self.motion = *motion;
        self.write(RegisterAddress::RatioNum, RegisterValue::I32(motion.ratio_num)).await?;
        self.write(RegisterAddress::RatioDen, RegisterValue::I32(motion.ratio_den)).await?;
        self.write(RegisterAddress::Acceleration, RegisterValue::F32(motion.acceleration)).await?;
        self.write(RegisterAddress::MaxSpeed, RegisterValue::F32(motion.max_speed)).await?;
        self.write(RegisterAddress::MinSpeed, RegisterValue::F32(motion.min_speed)).await
    }

    async fn write_synchro(&mut self, ratio: &SynchroRatio) -> RotaryResult<()> {
        self.synchro = *ratio;
        self.write(RegisterAddress::SynRatioNum, RegisterValue::I32(ratio.num)).await?;
        self.write(RegisterAddress::SynRatioDen, RegisterValue::I32(ratio.den)).await
    }
}

/// Unlisted codes are kept as `Mode::Unknown`; the link stays up
fn decode_mode(code: u16) -> Mode {
    let mode = Mode::from_wire(code);
    if let Mode::Unknown(code) = mode {
        warn!("Controller reported unknown mode code {}", code);
    }
    mode
}

/// Shared handle to one controller
pub struct Device<C: Connector> {
    shared: Arc<Mutex<Shared<C>>>,
}

impl<C: Connector> Clone for Device<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> Device<C> {
    /// Create a disconnected device holding the configured motion and
    /// synchro settings for upload
    pub fn new(connector: C, config: &ControllerConfig) -> Self {
        Self::from_manager(
            ConnectionManager::new(connector, config.link.clone(), &config.polling),
            config,
        )
    }

    pub fn with_logger(connector: C, config: &ControllerConfig, logger: CallbackLogger) -> Self {
        Self::from_manager(
            ConnectionManager::new(connector, config.link.clone(), &config.polling).with_logger(logger),
            config,
        )
    }

    fn from_manager(connection: ConnectionManager<C>, config: &ControllerConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                connection,
                last_mode: Mode::Disconnected,
                motion: config.motion,
                synchro: config.synchro,
            })),
        }
    }

    /// Open the link now; failures schedule a retry and are returned
    pub async fn connect(&self) -> RotaryResult<()> {
        self.shared.lock().await.connection.connect()
    }

    /// Reconnect if a retry is due; returns whether the link is up
    pub async fn maintain(&self) -> bool {
        self.shared.lock().await.connection.maintain()
    }

    /// True once after each successful connect
    pub async fn take_upload_request(&self) -> bool {
        self.shared.lock().await.connection.take_upload_request()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.lock().await.connection.is_connected()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.lock().await.connection.state().clone()
    }

    /// Mode from the most recent read, without I/O
    pub async fn last_mode(&self) -> Mode {
        self.shared.lock().await.last_mode
    }

    pub async fn close(&self) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.last_mode = Mode::Disconnected;
        shared.connection.close().await
    }

    // -- mode ------------------------------------------------------------

    /// Read the operating mode; `Disconnected` whenever the link is down
    pub async fn mode(&self) -> Mode {
        self.shared.lock().await.read_mode().await
    }

    /// Request a mode. The firmware decides the outcome; read it back on the
    /// next poll.
    pub async fn set_mode(&self, mode: Mode) -> RotaryResult<()> {
        self.shared.lock().await.write_mode(mode).await
    }

    /// Advisory check of a request against the last-read mode
    pub async fn check_intent(&self, intent: Intent) -> RotaryResult<()> {
        let mode = self.last_mode().await;
        if mode.permits(intent) {
            Ok(())
        } else {
            Err(RotaryError::precondition(format!("{:?} is not meaningful in mode {}", intent, mode)))
        }
    }

    // -- positions -------------------------------------------------------

    pub async fn current_position(&self) -> i32 {
        self.read_i32(RegisterAddress::CurrentPosition).await
    }

    /// Change the position reference. Allowed only while the last-read mode
    /// is `Halt`.
    pub async fn set_current_position(&self, steps: i32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        if shared.last_mode != Mode::Halt {
            return Err(RotaryError::precondition(
                "current position can be changed only while halted",
            ));
        }
        shared
            .write(RegisterAddress::CurrentPosition, RegisterValue::I32(steps))
            .await
    }

    pub async fn final_position(&self) -> i32 {
        self.read_i32(RegisterAddress::FinalPosition).await
    }

    pub async fn set_final_position(&self, steps: i32) -> RotaryResult<()> {
        self.write(RegisterAddress::FinalPosition, RegisterValue::I32(steps)).await
    }

    pub async fn spindle_position(&self) -> u16 {
        self.read(RegisterAddress::SpindlePosition).await.as_u16()
    }

    pub async fn set_spindle_position(&self, value: u16) -> RotaryResult<()> {
        self.write(RegisterAddress::SpindlePosition, RegisterValue::U16(value)).await
    }

    pub async fn encoder_position(&self) -> i32 {
        self.read_i32(RegisterAddress::EncoderPosition).await
    }

    pub async fn encoder_preset_value(&self) -> i32 {
        self.read_i32(RegisterAddress::EncoderPresetValue).await
    }

    pub async fn set_encoder_preset_value(&self, steps: i32) -> RotaryResult<()> {
        self.write(RegisterAddress::EncoderPresetValue, RegisterValue::I32(steps)).await
    }

    // -- motion parameters -----------------------------------------------

    pub async fn max_speed(&self) -> f32 {
        self.read_f32(RegisterAddress::MaxSpeed).await
    }

    pub async fn set_max_speed(&self, speed: f32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.motion.max_speed = speed;
        shared.write(RegisterAddress::MaxSpeed, RegisterValue::F32(speed)).await
    }

    pub async fn min_speed(&self) -> f32 {
        self.read_f32(RegisterAddress::MinSpeed).await
    }

    pub async fn set_min_speed(&self, speed: f32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.motion.min_speed = speed;
        shared.write(RegisterAddress::MinSpeed, RegisterValue::F32(speed)).await
    }

    /// Measured axis speed
    pub async fn current_speed(&self) -> f32 {
        self.read_f32(RegisterAddress::CurrentSpeed).await
    }

    pub async fn acceleration(&self) -> f32 {
        self.read_f32(RegisterAddress::Acceleration).await
    }

    pub async fn set_acceleration(&self, acceleration: f32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.motion.acceleration = acceleration;
        shared
            .write(RegisterAddress::Acceleration, RegisterValue::F32(acceleration))
            .await
    }

    pub async fn ratio_num(&self) -> i32 {
        self.read_i32(RegisterAddress::RatioNum).await
    }

    pub async fn set_ratio_num(&self, num: i32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.motion.ratio_num = num;
        shared.write(RegisterAddress::RatioNum, RegisterValue::I32(num)).await
    }

    pub async fn ratio_den(&self) -> i32 {
        self.read_i32(RegisterAddress::RatioDen).await
    }

    pub async fn set_ratio_den(&self, den: i32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.motion.ratio_den = den;
        shared.write(RegisterAddress::RatioDen, RegisterValue::I32(den)).await
    }

    pub async fn syn_ratio_num(&self) -> i32 {
        self.read_i32(RegisterAddress::SynRatioNum).await
    }

    pub async fn set_syn_ratio_num(&self, num: i32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.synchro.num = num;
        shared.write(RegisterAddress::SynRatioNum, RegisterValue::I32(num)).await
    }

    pub async fn syn_ratio_den(&self) -> i32 {
        self.read_i32(RegisterAddress::SynRatioDen).await
    }

    pub async fn set_syn_ratio_den(&self, den: i32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.synchro.den = den;
        shared.write(RegisterAddress::SynRatioDen, RegisterValue::I32(den)).await
    }

    /// Motion settings held for upload
    pub async fn motion_parameters(&self) -> MotionParameters {
        self.shared.lock().await.motion
    }

    pub async fn synchro_ratio(&self) -> SynchroRatio {
        self.shared.lock().await.synchro
    }

    // -- composite requests ----------------------------------------------

    /// Push all motion parameters, one write each
    pub async fn upload_motion(&self, motion: &MotionParameters) -> RotaryResult<()> {
        self.shared.lock().await.write_motion(motion).await
    }

    pub async fn upload_synchro(&self, ratio: &SynchroRatio) -> RotaryResult<()> {
        self.shared.lock().await.write_synchro(ratio).await
    }

    /// Re-push the held motion and synchro settings, used after a reconnect
    pub async fn reupload(&self) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        let (motion, synchro) = (shared.motion, shared.synchro);
        info!(
            "Uploading configuration: ratio {}/{}, speed {}..{}, synchro {}/{}",
            motion.ratio_num, motion.ratio_den, motion.min_speed, motion.max_speed, synchro.num, synchro.den
        );
        shared.write_motion(&motion).await?;
        shared.write_synchro(&synchro).await
    }

    /// Command an indexed move to a physical position
    ///
    /// Re-asserts the motion parameters, requests `Halt`, then writes the
    /// destination converted to steps.
    pub async fn move_to(&self, position: f64, motion: &MotionParameters) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.write_motion(motion).await?;
        shared.write_mode(Mode::Halt).await?;
        shared
            .write(RegisterAddress::FinalPosition, RegisterValue::I32(motion.to_steps(position)))
            .await
    }

    /// Write the synchro ratio and request `SynchroInit`
    pub async fn request_synchro(&self, ratio: &SynchroRatio) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared.write_synchro(ratio).await?;
        shared.write_mode(Mode::SynchroInit).await
    }

    pub async fn request_index(&self) -> RotaryResult<()> {
        self.set_mode(Mode::IndexInit).await
    }

    pub async fn request_halt(&self) -> RotaryResult<()> {
        self.set_mode(Mode::Halt).await
    }

    /// Write the encoder preset and request `SetEncoder` to latch it
    pub async fn preset_encoder(&self, steps: i32) -> RotaryResult<()> {
        let mut shared = self.shared.lock().await;
        shared
            .write(RegisterAddress::EncoderPresetValue, RegisterValue::I32(steps))
            .await?;
        shared.write_mode(Mode::SetEncoder).await
    }

    /// Read the fast data block in one exchange
    ///
    /// Returns `None` while the link is down or when the read fails; the
    /// failure is absorbed like any other.
    pub async fn poll_fast_data(&self) -> Option<FastReadings> {
        let mut shared = self.shared.lock().await;
        let client = shared.connection.client_mut()?;
        match client.read_block(0, &FAST_DATA_FIELDS).await {
            Ok(values) => {
                let readings = FastReadings {
                    mode: decode_mode(values[0].as_u16()),
                    current_position: values[1].as_i32(),
                    final_position: values[2].as_i32(),
                    encoder_position: values[3].as_i32(),
                    current_speed: values[4].as_f32(),
                };
                shared.last_mode = readings.mode;
                Some(readings)
            }
            Err(e) => {
                shared.absorb("fast data poll", e);
                None
            }
        }
    }

    async fn read(&self, register: RegisterAddress) -> RegisterValue {
        self.shared.lock().await.read(register).await
    }

    async fn read_i32(&self, register: RegisterAddress) -> i32 {
        self.read(register).await.as_i32()
    }

    async fn read_f32(&self, register: RegisterAddress) -> f32 {
        self.read(register).await.as_f32()
    }

    async fn write(&self, register: RegisterAddress, value: RegisterValue) -> RotaryResult<()> {
        self.shared.lock().await.write(register, value).await
    }
}
