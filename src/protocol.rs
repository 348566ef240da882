/// Modbus protocol definitions and RTU framing
///
/// The rotary controller answers three function codes: read holding
/// registers, write single register and write multiple registers. This
/// module holds the request/response structures for them and the RTU frame
/// encoding shared by the serial transport and the simulated controller.

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec;
use crate::error::{RotaryError, RotaryResult};
use crate::utils::validation;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Maximum number of registers in one read request
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Maximum number of registers in one write-multiple request
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus function codes used by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> RotaryResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(RotaryError::protocol(format!(
                "Unsupported function code: 0x{:02X}",
                value
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_read_function(self) -> bool {
        self == ModbusFunction::ReadHoldingRegisters
    }

    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
}

impl ModbusException {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Modbus request
///
/// For writes, `data` holds the register bytes only; the byte count of a
/// write-multiple frame is added by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    pub fn read_holding(slave_id: SlaveId, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    pub fn write_single(slave_id: SlaveId, address: ModbusAddress, value: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    pub fn write_multiple(slave_id: SlaveId, address: ModbusAddress, values: &[u16]) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: codec::registers_to_bytes(values),
        }
    }

    /// Registers carried by a write request
    pub fn registers(&self) -> Vec<u16> {
        codec::bytes_to_registers(&self.data)
    }

    /// Validate the request
    pub fn validate(&self) -> RotaryResult<()> {
        validation::validate_slave_id(self.slave_id)?;

        let limit = match self.function {
            ModbusFunction::ReadHoldingRegisters => MAX_REGISTERS_PER_READ,
            ModbusFunction::WriteSingleRegister => 1,
            ModbusFunction::WriteMultipleRegisters => MAX_REGISTERS_PER_WRITE,
        };
        if self.quantity == 0 || self.quantity > limit {
            return Err(RotaryError::invalid_address(self.address, self.quantity));
        }

        if self.function.is_write_function() && self.data.len() != self.quantity as usize * 2 {
            return Err(RotaryError::invalid_data(format!(
                "Write of {} registers carries {} bytes",
                self.quantity,
                self.data.len()
            )));
        }

        Ok(())
    }
}

/// Modbus response
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception: Option<u8>,
}

impl ModbusResponse {
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, exception_code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception: Some(exception_code),
        }
    }

    /// Successful read reply carrying `registers`
    pub fn registers_read(slave_id: SlaveId, registers: &[u16]) -> Self {
        let mut data = Vec::with_capacity(1 + registers.len() * 2);
        data.push((registers.len() * 2) as u8);
        data.extend(codec::registers_to_bytes(registers));
        Self::new_success(slave_id, ModbusFunction::ReadHoldingRegisters, data)
    }

    /// Successful write reply echoing address and value/quantity
    pub fn write_echo(slave_id: SlaveId, function: ModbusFunction, address: u16, word: u16) -> Self {
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(&word.to_be_bytes());
        Self::new_success(slave_id, function, data)
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn get_exception(&self) -> Option<RotaryError> {
        self.exception
            .map(|code| RotaryError::exception(self.function.to_u8(), code))
    }

    /// Parse response data as registers
    pub fn parse_registers(&self) -> RotaryResult<Vec<u16>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| RotaryError::frame("Empty response data"))? as usize;
        if self.data.len() < 1 + byte_count {
            return Err(RotaryError::frame("Incomplete register data"));
        }
        if byte_count % 2 != 0 {
            return Err(RotaryError::frame("Invalid register data length"));
        }

        Ok(codec::bytes_to_registers(&self.data[1..1 + byte_count]))
    }

    /// Parse the address/word echo of a write reply
    pub fn parse_echo(&self) -> RotaryResult<(u16, u16)> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }
        if self.data.len() < 4 {
            return Err(RotaryError::frame("Write reply too short"));
        }
        Ok((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }
}

/// RTU frame encoding: slave id, PDU, CRC-16 (little-endian)
pub mod rtu {
    use super::*;

    pub fn calculate_crc(data: &[u8]) -> u16 {
        CRC_MODBUS.checksum(data)
    }

    fn append_crc(mut frame: Vec<u8>) -> Vec<u8> {
        let crc = calculate_crc(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Strip and verify the CRC, returning the frame body
    fn checked_body(frame: &[u8]) -> RotaryResult<&[u8]> {
        if frame.len() < 4 {
            return Err(RotaryError::frame("RTU frame too short"));
        }
        let data_len = frame.len() - 2;
        let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
        let calculated = calculate_crc(&frame[..data_len]);
        if received != calculated {
            return Err(RotaryError::crc_mismatch(calculated, received));
        }
        Ok(&frame[..data_len])
    }

    /// Encode request to RTU frame
    pub fn encode_request(request: &ModbusRequest) -> Vec<u8> {
        let mut frame = vec![request.slave_id, request.function.to_u8()];
        frame.extend_from_slice(&request.address.to_be_bytes());

        match request.function {
            ModbusFunction::ReadHoldingRegisters => {
                frame.extend_from_slice(&request.quantity.to_be_bytes());
            }
            ModbusFunction::WriteSingleRegister => {
                if request.data.len() >= 2 {
                    frame.extend_from_slice(&request.data[0..2]);
                } else {
                    frame.extend_from_slice(&[0, 0]);
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                frame.extend_from_slice(&request.quantity.to_be_bytes());
                frame.push(request.data.len() as u8);
                frame.extend_from_slice(&request.data);
            }
        }

        append_crc(frame)
    }

    /// Decode a request frame (controller side)
    pub fn decode_request(frame: &[u8]) -> RotaryResult<ModbusRequest> {
        let body = checked_body(frame)?;
        if body.len() < 6 {
            return Err(RotaryError::frame("RTU request too short"));
        }

        let slave_id = body[0];
        let function = ModbusFunction::from_u8(body[1])?;
        let address = u16::from_be_bytes([body[2], body[3]]);
        let word = u16::from_be_bytes([body[4], body[5]]);

        let request = match function {
            ModbusFunction::ReadHoldingRegisters => ModbusRequest::read_holding(slave_id, address, word),
            ModbusFunction::WriteSingleRegister => ModbusRequest::write_single(slave_id, address, word),
            ModbusFunction::WriteMultipleRegisters => {
                let byte_count = *body
                    .get(6)
                    .ok_or_else(|| RotaryError::frame("Missing byte count"))? as usize;
                let payload = body
                    .get(7..7 + byte_count)
                    .ok_or_else(|| RotaryError::frame("Incomplete write payload"))?;
                ModbusRequest {
                    slave_id,
                    function,
                    address,
                    quantity: word,
                    data: payload.to_vec(),
                }
            }
        };

        Ok(request)
    }

    /// Encode response to RTU frame (controller side)
    pub fn encode_response(response: &ModbusResponse) -> Vec<u8> {
        let mut frame = vec![response.slave_id];
        match response.exception {
            Some(code) => {
                frame.push(response.function.to_u8() | 0x80);
                frame.push(code);
            }
            None => {
                frame.push(response.function.to_u8());
                frame.extend_from_slice(&response.data);
            }
        }
        append_crc(frame)
    }

    /// Decode response from RTU frame
    pub fn decode_response(frame: &[u8]) -> RotaryResult<ModbusResponse> {
        let body = checked_body(frame)?;
        let slave_id = body[0];
        let function_code = body[1];

        if function_code & 0x80 != 0 {
            if body.len() < 3 {
                return Err(RotaryError::frame("Invalid exception response"));
            }
            return Ok(ModbusResponse::new_exception(
                slave_id,
                ModbusFunction::from_u8(function_code & 0x7F)?,
                body[2],
            ));
        }

        let function = ModbusFunction::from_u8(function_code)?;
        Ok(ModbusResponse::new_success(slave_id, function, body[2..].to_vec()))
    }
}
