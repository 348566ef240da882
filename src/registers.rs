//! Controller register map and operating modes
//!
//! The register file of the rotary controller is fixed by the firmware.
//! Each field has exactly one wire representation; long and float fields
//! span two consecutive registers in [`ByteOrder::LittleSwap`](crate::codec::ByteOrder).
//!
//! | Offset | Field | Kind |
//! |--------|-------|------|
//! | 0 | mode | u16 |
//! | 2 | current position | i32 |
//! | 4 | final position | i32 |
//! | 6 | spindle / auxiliary | u16 |
//! | 8 | encoder position | i32 |
//! | 12 | encoder preset value | i32 |
//! | 16 | max speed | f32 |
//! | 18 | min speed | f32 |
//! | 20 | current speed | f32 |
//! | 22 | acceleration | f32 |
//! | 24 | ratio numerator | i32 |
//! | 26 | ratio denominator | i32 |
//! | 30 | synchro ratio numerator | i32 |
//! | 32 | synchro ratio denominator | i32 |
//!
//! Offsets 10, 14 and 28 are unused by the firmware and never written.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ValueKind;
use crate::error::{RotaryError, RotaryResult};

/// Register offsets the firmware leaves unused
pub const RESERVED_OFFSETS: [u16; 3] = [10, 14, 28];

/// Number of registers in the controller's register file
pub const REGISTER_FILE_SIZE: u16 = 34;

/// Named register of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterAddress {
    Mode,
    CurrentPosition,
    FinalPosition,
    SpindlePosition,
    EncoderPosition,
    EncoderPresetValue,
    MaxSpeed,
    MinSpeed,
    CurrentSpeed,
    Acceleration,
    RatioNum,
    RatioDen,
    SynRatioNum,
    SynRatioDen,
}

impl RegisterAddress {
    pub const ALL: [RegisterAddress; 14] = [
        RegisterAddress::Mode,
        RegisterAddress::CurrentPosition,
        RegisterAddress::FinalPosition,
        RegisterAddress::SpindlePosition,
        RegisterAddress::EncoderPosition,
        RegisterAddress::EncoderPresetValue,
        RegisterAddress::MaxSpeed,
        RegisterAddress::MinSpeed,
        RegisterAddress::CurrentSpeed,
        RegisterAddress::Acceleration,
        RegisterAddress::RatioNum,
        RegisterAddress::RatioDen,
        RegisterAddress::SynRatioNum,
        RegisterAddress::SynRatioDen,
    ];

    /// Register offset in the controller's register file
    pub const fn offset(self) -> u16 {
        match self {
            RegisterAddress::Mode => 0,
            RegisterAddress::CurrentPosition => 2,
            RegisterAddress::FinalPosition => 4,
            RegisterAddress::SpindlePosition => 6,
            RegisterAddress::EncoderPosition => 8,
            RegisterAddress::EncoderPresetValue => 12,
            RegisterAddress::MaxSpeed => 16,
            RegisterAddress::MinSpeed => 18,
            RegisterAddress::CurrentSpeed => 20,
            RegisterAddress::Acceleration => 22,
            RegisterAddress::RatioNum => 24,
            RegisterAddress::RatioDen => 26,
            RegisterAddress::SynRatioNum => 30,
            RegisterAddress::SynRatioDen => 32,
        }
    }

    /// Wire representation of the field
    pub const fn kind(self) -> ValueKind {
        match self {
            RegisterAddress::Mode | RegisterAddress::SpindlePosition => ValueKind::U16,
            RegisterAddress::MaxSpeed
            | RegisterAddress::MinSpeed
            | RegisterAddress::CurrentSpeed
            | RegisterAddress::Acceleration => ValueKind::F32,
            _ => ValueKind::I32,
        }
    }

    /// Find the field starting at `offset`
    pub fn from_offset(offset: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.offset() == offset)
    }

    /// Find the field that owns `offset`, including the second register of
    /// a 32-bit field
    pub fn containing(offset: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| {
            let start = r.offset();
            offset >= start && offset < start + r.kind().register_count()
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            RegisterAddress::Mode => "mode",
            RegisterAddress::CurrentPosition => "current_position",
            RegisterAddress::FinalPosition => "final_position",
            RegisterAddress::SpindlePosition => "spindle_position",
            RegisterAddress::EncoderPosition => "encoder_position",
            RegisterAddress::EncoderPresetValue => "encoder_preset_value",
            RegisterAddress::MaxSpeed => "max_speed",
            RegisterAddress::MinSpeed => "min_speed",
            RegisterAddress::CurrentSpeed => "current_speed",
            RegisterAddress::Acceleration => "acceleration",
            RegisterAddress::RatioNum => "ratio_num",
            RegisterAddress::RatioDen => "ratio_den",
            RegisterAddress::SynRatioNum => "syn_ratio_num",
            RegisterAddress::SynRatioDen => "syn_ratio_den",
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), self.offset())
    }
}

/// Reject register ranges that touch a reserved offset or run past the
/// register file
pub fn check_writable(start: u16, count: u16) -> RotaryResult<()> {
    let end = start as u32 + count as u32;
    if count == 0 || end > REGISTER_FILE_SIZE as u32 {
        return Err(RotaryError::invalid_address(start, count));
    }
    if RESERVED_OFFSETS
        .iter()
        .any(|&r| (r as u32) >= start as u32 && (r as u32) < end)
    {
        return Err(RotaryError::invalid_address(start, count));
    }
    Ok(())
}

/// Operating mode of the controller
///
/// `Disconnected` never goes on the wire. The client substitutes it for the
/// last read mode whenever the link is known to be down. `Unknown` carries a
/// code read over a healthy link that the firmware table does not list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Halt,
    Index,
    IndexInit,
    Synchro,
    SynchroInit,
    Jog,
    JogForward,
    JogBackward,
    SetEncoder,
    SynchroBadRatio,
    Disconnected,
    Unknown(u16),
}

impl Mode {
    pub const fn code(self) -> u16 {
        match self {
            Mode::Halt => 0,
            Mode::Index => 10,
            Mode::IndexInit => 11,
            Mode::Synchro => 20,
            Mode::SynchroInit => 21,
            Mode::Jog => 30,
            Mode::JogForward => 31,
            Mode::JogBackward => 32,
            Mode::SetEncoder => 40,
            Mode::SynchroBadRatio => 101,
            Mode::Disconnected => 255,
            Mode::Unknown(code) => code,
        }
    }

    /// Decode a mode register value
    pub fn from_code(code: u16) -> RotaryResult<Self> {
        match code {
            0 => Ok(Mode::Halt),
            10 => Ok(Mode::Index),
            11 => Ok(Mode::IndexInit),
            20 => Ok(Mode::Synchro),
            21 => Ok(Mode::SynchroInit),
            30 => Ok(Mode::Jog),
            31 => Ok(Mode::JogForward),
            32 => Ok(Mode::JogBackward),
            40 => Ok(Mode::SetEncoder),
            101 => Ok(Mode::SynchroBadRatio),
            255 => Ok(Mode::Disconnected),
            other => Err(RotaryError::invalid_data(format!("Unknown mode code: {}", other))),
        }
    }

    /// Decode a mode register value read from the controller, keeping
    /// unlisted codes as [`Mode::Unknown`]
    pub fn from_wire(code: u16) -> Self {
        match Self::from_code(code) {
            Ok(Mode::Disconnected) | Err(_) => Mode::Unknown(code),
            Ok(mode) => mode,
        }
    }

    /// Whether the mode may be written to the controller
    pub fn is_transmittable(self) -> bool {
        !matches!(self, Mode::Disconnected | Mode::Unknown(_))
    }

    /// Request states the firmware leaves on its own
    pub fn is_transient(self) -> bool {
        matches!(self, Mode::IndexInit | Mode::SynchroInit | Mode::SetEncoder)
    }

    pub fn is_fault(self) -> bool {
        self == Mode::SynchroBadRatio
    }

    /// Modes in which the axis may be moving
    pub fn is_motion(self) -> bool {
        matches!(
            self,
            Mode::Index | Mode::Synchro | Mode::Jog | Mode::JogForward | Mode::JogBackward
        )
    }

    /// Advisory check of whether a client request is meaningful in this mode
    ///
    /// The firmware is the authority on transitions; this only documents
    /// client-side intent. Anything not listed here is left to the firmware
    /// and reported as not permitted.
    pub fn permits(self, intent: Intent) -> bool {
        use Intent::*;
        match self {
            Mode::Halt => matches!(
                intent,
                WriteCurrentPosition
                    | RequestIndex
                    | RequestSynchro
                    | RequestHalt
                    | PresetEncoder
                    | ConfigureMotion
                    | AdjustSynchroRatio
                    | Jog
            ),
            Mode::Index => matches!(
                intent,
                WriteFinalPosition | ConfigureMotion | RequestHalt
            ),
            Mode::Synchro => matches!(intent, AdjustSynchroRatio | RequestHalt),
            Mode::Jog | Mode::JogForward | Mode::JogBackward => {
                matches!(intent, Jog | RequestHalt)
            }
            Mode::IndexInit | Mode::SynchroInit | Mode::SetEncoder => {
                matches!(intent, RequestHalt)
            }
            Mode::SynchroBadRatio => matches!(intent, RequestHalt | AdjustSynchroRatio),
            Mode::Unknown(_) => matches!(intent, RequestHalt),
            Mode::Disconnected => false,
        }
    }

    /// Modes the firmware is expected to reach after a request in this mode
    pub fn expected_outcomes(self) -> &'static [Mode] {
        match self {
            Mode::IndexInit => &[Mode::Index, Mode::Halt],
            Mode::SynchroInit => &[Mode::Synchro, Mode::Halt, Mode::SynchroBadRatio],
            Mode::SetEncoder => &[Mode::Halt],
            _ => &[],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Halt => "Halt",
            Mode::Index => "Index",
            Mode::IndexInit => "Index (init)",
            Mode::Synchro => "Synchro",
            Mode::SynchroInit => "Synchro (init)",
            Mode::Jog => "Jog",
            Mode::JogForward => "Jog forward",
            Mode::JogBackward => "Jog backward",
            Mode::SetEncoder => "Set encoder",
            Mode::SynchroBadRatio => "Synchro bad ratio",
            Mode::Disconnected => "Disconnected",
            Mode::Unknown(_) => "Unknown",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Client-initiated requests whose meaning depends on the current mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    WriteCurrentPosition,
    WriteFinalPosition,
    ConfigureMotion,
    AdjustSynchroRatio,
    PresetEncoder,
    RequestIndex,
    RequestSynchro,
    RequestHalt,
    Jog,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_map_offsets() {
        assert_eq!(RegisterAddress::Mode.offset(), 0);
        assert_eq!(RegisterAddress::EncoderPresetValue.offset(), 12);
        assert_eq!(RegisterAddress::SynRatioDen.offset(), 32);
        assert_eq!(RegisterAddress::MaxSpeed.kind(), ValueKind::F32);
        assert_eq!(RegisterAddress::SpindlePosition.kind(), ValueKind::U16);
        assert_eq!(RegisterAddress::RatioDen.kind(), ValueKind::I32);
    }

    #[test]
    fn test_register_map_does_not_overlap() {
        for a in RegisterAddress::ALL {
            for b in RegisterAddress::ALL {
                if a == b {
                    continue;
                }
                let a_end = a.offset() + a.kind().register_count();
                assert!(a_end <= b.offset() || b.offset() + b.kind().register_count() <= a.offset());
            }
            for reserved in RESERVED_OFFSETS {
                assert_ne!(RegisterAddress::containing(reserved), Some(a));
            }
            assert!(a.offset() + a.kind().register_count() <= REGISTER_FILE_SIZE);
        }
    }

    #[test]
    fn test_lookup_by_offset() {
        assert_eq!(RegisterAddress::from_offset(20), Some(RegisterAddress::CurrentSpeed));
        assert_eq!(RegisterAddress::from_offset(21), None);
        assert_eq!(RegisterAddress::containing(21), Some(RegisterAddress::CurrentSpeed));
        assert_eq!(RegisterAddress::containing(10), None);
    }

    #[test]
    fn test_check_writable() {
        assert!(check_writable(2, 2).is_ok());
        assert!(check_writable(30, 4).is_ok());
        assert!(check_writable(10, 1).is_err());
        assert!(check_writable(8, 4).is_err());
        assert!(check_writable(28, 2).is_err());
        assert!(check_writable(33, 2).is_err());
        assert!(check_writable(0, 0).is_err());
    }

    #[test]
    fn test_mode_codes() {
        for mode in [
            Mode::Halt,
            Mode::Index,
            Mode::IndexInit,
            Mode::Synchro,
            Mode::SynchroInit,
            Mode::Jog,
            Mode::JogForward,
            Mode::JogBackward,
            Mode::SetEncoder,
            Mode::SynchroBadRatio,
            Mode::Disconnected,
        ] {
            assert_eq!(Mode::from_code(mode.code()).unwrap(), mode);
        }
        assert_eq!(Mode::SynchroBadRatio.code(), 101);
        assert!(Mode::from_code(7).is_err());
        assert!(!Mode::Disconnected.is_transmittable());

        assert_eq!(Mode::from_wire(21), Mode::SynchroInit);
        assert_eq!(Mode::from_wire(7), Mode::Unknown(7));
        assert_eq!(Mode::from_wire(255), Mode::Unknown(255));
        assert_eq!(Mode::Unknown(7).code(), 7);
        assert!(!Mode::Unknown(7).is_transmittable());
        assert_eq!(Mode::Unknown(7).to_string(), "Unknown (7)");
    }

    #[test]
    fn test_advisory_intents() {
        assert!(Mode::Halt.permits(Intent::WriteCurrentPosition));
        assert!(Mode::Halt.permits(Intent::RequestSynchro));
        assert!(!Mode::Index.permits(Intent::WriteCurrentPosition));
        assert!(Mode::Index.permits(Intent::WriteFinalPosition));
        assert!(!Mode::Synchro.permits(Intent::WriteFinalPosition));
        assert!(Mode::Synchro.permits(Intent::AdjustSynchroRatio));
        assert!(Mode::SynchroBadRatio.permits(Intent::RequestHalt));
        assert!(!Mode::SynchroBadRatio.permits(Intent::RequestIndex));
        assert!(!Mode::Disconnected.permits(Intent::RequestHalt));
        assert!(Mode::SynchroInit.expected_outcomes().contains(&Mode::SynchroBadRatio));
    }
}
