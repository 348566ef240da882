//! Register value encoding and decoding
//!
//! Pure functions converting between wire bytes, 16-bit registers and the
//! typed values the controller exposes. Modbus transmits every register
//! big-endian; the byte order below only governs how the four bytes of a
//! 32-bit value are spread over two consecutive registers.
//!
//! Writing the bytes of `0xAABBCCDD` as `A B C D`:
//!
//! | Order | Wire bytes | Registers |
//! |-------|------------|-----------|
//! | `Big` | `A B C D` | `[0xAABB, 0xCCDD]` |
//! | `Little` | `D C B A` | `[0xDDCC, 0xBBAA]` |
//! | `BigSwap` | `B A D C` | `[0xBBAA, 0xDDCC]` |
//! | `LittleSwap` | `C D A B` | `[0xCCDD, 0xAABB]` |
//!
//! The controller firmware stores longs and floats in its native layout,
//! which is `LittleSwap`: low word first. Every 32-bit field of the register
//! map uses it.
//!
//! Buffers of the wrong length are programming errors and panic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Arrangement of a 32-bit value across two registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    /// ABCD
    Big,
    /// DCBA
    Little,
    /// BADC
    BigSwap,
    /// CDAB, the controller's native layout
    #[default]
    LittleSwap,
}

impl ByteOrder {
    /// Rearrange big-endian `ABCD` bytes into this order. The permutation is
    /// its own inverse for every variant, so the same call maps wire bytes
    /// back to `ABCD`.
    fn permute(self, bytes: [u8; 4]) -> [u8; 4] {
        let [a, b, c, d] = bytes;
        match self {
            ByteOrder::Big => [a, b, c, d],
            ByteOrder::Little => [d, c, b, a],
            ByteOrder::BigSwap => [b, a, d, c],
            ByteOrder::LittleSwap => [c, d, a, b],
        }
    }
}

/// Wire representation kind of a register-map field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// One unsigned 16-bit register
    U16,
    /// Signed 32-bit integer over two registers
    I32,
    /// IEEE-754 single precision over two registers
    F32,
}

impl ValueKind {
    /// Number of consecutive registers the value occupies
    pub fn register_count(self) -> u16 {
        match self {
            ValueKind::U16 => 1,
            ValueKind::I32 | ValueKind::F32 => 2,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::U16 => "u16",
            ValueKind::I32 => "i32",
            ValueKind::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// A decoded register-map value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegisterValue {
    U16(u16),
    I32(i32),
    F32(f32),
}

impl RegisterValue {
    /// Zero of the given kind, the fallback reported for failed reads
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::U16 => RegisterValue::U16(0),
            ValueKind::I32 => RegisterValue::I32(0),
            ValueKind::F32 => RegisterValue::F32(0.0),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            RegisterValue::U16(_) => ValueKind::U16,
            RegisterValue::I32(_) => ValueKind::I32,
            RegisterValue::F32(_) => ValueKind::F32,
        }
    }

    /// Encode into registers ready for a write request
    pub fn to_registers(&self, order: ByteOrder) -> Vec<u16> {
        match *self {
            RegisterValue::U16(v) => vec![v],
            RegisterValue::I32(v) => encode_signed_long_registers(v, order).to_vec(),
            RegisterValue::F32(v) => encode_float32_registers(v, order).to_vec(),
        }
    }

    /// Decode registers read from the controller
    ///
    /// # Panics
    ///
    /// If `registers` does not hold exactly `kind.register_count()` values.
    pub fn from_registers(kind: ValueKind, registers: &[u16], order: ByteOrder) -> Self {
        match kind {
            ValueKind::U16 => {
                assert_eq!(registers.len(), 1, "u16 value needs exactly one register");
                RegisterValue::U16(registers[0])
            }
            ValueKind::I32 => RegisterValue::I32(decode_signed_long_registers(registers, order)),
            ValueKind::F32 => RegisterValue::F32(decode_float32_registers(registers, order)),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match *self {
            RegisterValue::U16(v) => v,
            RegisterValue::I32(v) => v as u16,
            RegisterValue::F32(v) => v as u16,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match *self {
            RegisterValue::U16(v) => v as i32,
            RegisterValue::I32(v) => v,
            RegisterValue::F32(v) => v as i32,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            RegisterValue::U16(v) => v as f32,
            RegisterValue::I32(v) => v as f32,
            RegisterValue::F32(v) => v,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::U16(v) => write!(f, "{}", v),
            RegisterValue::I32(v) => write!(f, "{}", v),
            RegisterValue::F32(v) => write!(f, "{}", v),
        }
    }
}

fn four_bytes(bytes: &[u8]) -> [u8; 4] {
    bytes
        .try_into()
        .unwrap_or_else(|_| panic!("32-bit value needs exactly 4 bytes, got {}", bytes.len()))
}

/// Decode one register from its two wire bytes
pub fn decode_unsigned16(bytes: &[u8]) -> u16 {
    assert_eq!(bytes.len(), 2, "register needs exactly 2 bytes");
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub fn encode_unsigned16(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Decode a signed 32-bit value from four wire bytes
pub fn decode_signed_long(bytes: &[u8], order: ByteOrder) -> i32 {
    i32::from_be_bytes(order.permute(four_bytes(bytes)))
}

pub fn encode_signed_long(value: i32, order: ByteOrder) -> [u8; 4] {
    order.permute(value.to_be_bytes())
}

/// Decode an unsigned 32-bit value from four wire bytes
pub fn decode_unsigned_long(bytes: &[u8], order: ByteOrder) -> u32 {
    u32::from_be_bytes(order.permute(four_bytes(bytes)))
}

pub fn encode_unsigned_long(value: u32, order: ByteOrder) -> [u8; 4] {
    order.permute(value.to_be_bytes())
}

/// Decode an IEEE-754 float from four wire bytes
pub fn decode_float32(bytes: &[u8], order: ByteOrder) -> f32 {
    f32::from_bits(decode_unsigned_long(bytes, order))
}

pub fn encode_float32(value: f32, order: ByteOrder) -> [u8; 4] {
    encode_unsigned_long(value.to_bits(), order)
}

/// Convert registers to their wire bytes (big-endian per register)
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Convert wire bytes to registers
///
/// # Panics
///
/// If the byte count is odd.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    assert!(bytes.len() % 2 == 0, "register data must have an even byte count");
    bytes.chunks_exact(2).map(decode_unsigned16).collect()
}

fn two_registers(registers: &[u16]) -> [u8; 4] {
    assert_eq!(registers.len(), 2, "32-bit value needs exactly two registers");
    let [a, b] = registers[0].to_be_bytes();
    let [c, d] = registers[1].to_be_bytes();
    [a, b, c, d]
}

fn split_registers(bytes: [u8; 4]) -> [u16; 2] {
    [
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ]
}

pub fn decode_signed_long_registers(registers: &[u16], order: ByteOrder) -> i32 {
    decode_signed_long(&two_registers(registers), order)
}

pub fn encode_signed_long_registers(value: i32, order: ByteOrder) -> [u16; 2] {
    split_registers(encode_signed_long(value, order))
}

pub fn decode_unsigned_long_registers(registers: &[u16], order: ByteOrder) -> u32 {
    decode_unsigned_long(&two_registers(registers), order)
}

pub fn encode_unsigned_long_registers(value: u32, order: ByteOrder) -> [u16; 2] {
    split_registers(encode_unsigned_long(value, order))
}

pub fn decode_float32_registers(registers: &[u16], order: ByteOrder) -> f32 {
    decode_float32(&two_registers(registers), order)
}

pub fn encode_float32_registers(value: f32, order: ByteOrder) -> [u16; 2] {
    split_registers(encode_float32(value, order))
}
