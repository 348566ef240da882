/// Register-level client for the rotary controller
///
/// `RegisterClient` turns raw Modbus exchanges into typed field access. It
/// knows the controller's slave address and the word layout of 32-bit fields,
/// so callers read and write `i32`/`f32` values and never see register pairs.
///
/// Every call is exactly one exchange on the transport. All field writes go
/// out as write-multiple (0x10) requests, one register for 16-bit fields and
/// two for 32-bit fields, so the controller never observes a half-written
/// value. The controller firmware does not implement 0x06.

use async_trait::async_trait;

use crate::codec::{self, ByteOrder, RegisterValue};
use crate::config::LinkConfig;
use crate::error::{RotaryError, RotaryResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId, MAX_REGISTERS_PER_READ, MAX_REGISTERS_PER_WRITE};
use crate::registers::{self, RegisterAddress};
use crate::transport::{ModbusTransport, RtuTransport, TransportStats};

/// Raw register access by function code
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read holding registers (function code 0x03)
    async fn read_03(&mut self, address: u16, quantity: u16) -> RotaryResult<Vec<u16>>;

    /// Write single register (function code 0x06)
    async fn write_06(&mut self, address: u16, value: u16) -> RotaryResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_10(&mut self, address: u16, values: &[u16]) -> RotaryResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self) -> RotaryResult<()>;

    fn get_stats(&self) -> TransportStats;
}

/// Typed client over any transport
pub struct RegisterClient<T: ModbusTransport> {
    transport: T,
    slave_id: SlaveId,
    byte_order: ByteOrder,
    logger: Option<CallbackLogger>,
}

impl RegisterClient<RtuTransport> {
    /// Open the serial link described by `link`
    pub fn open(link: &LinkConfig) -> RotaryResult<Self> {
        let transport = RtuTransport::open(link)?;
        Ok(Self::with_byte_order(transport, link.slave_id, link.byte_order))
    }
}

impl<T: ModbusTransport> RegisterClient<T> {
    /// Client using the controller's native word layout
    pub fn new(transport: T, slave_id: SlaveId) -> Self {
        Self::with_byte_order(transport, slave_id, ByteOrder::default())
    }

    pub fn with_byte_order(transport: T, slave_id: SlaveId, byte_order: ByteOrder) -> Self {
        Self {
            transport,
            slave_id,
            byte_order,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Execute a raw request
    pub async fn execute_request(&mut self, request: ModbusRequest) -> RotaryResult<ModbusResponse> {
        if let Some(ref logger) = self.logger {
            logger.log_request(&request);
        }

        let result = self.transport.request(&request).await;

        if let Some(ref logger) = self.logger {
            match &result {
                Ok(response) => logger.log_response(&request, response),
                Err(e) => logger.warn(&format!("Request to {} failed: {}", request.address, e)),
            }
        }

        result
    }

    /// Read a 16-bit field
    pub async fn read_register(&mut self, address: u16) -> RotaryResult<u16> {
        let registers = self.read_03(address, 1).await?;
        Ok(registers[0])
    }

    /// Write a 16-bit field as a one-register 0x10 request
    pub async fn write_register(&mut self, address: u16, value: u16) -> RotaryResult<()> {
        self.write_10(address, &[value]).await
    }

    /// Read a signed 32-bit field spanning `address` and `address + 1`
    pub async fn read_long(&mut self, address: u16) -> RotaryResult<i32> {
        let registers = self.read_03(address, 2).await?;
        Ok(codec::decode_signed_long_registers(&registers, self.byte_order))
    }

    pub async fn read_unsigned_long(&mut self, address: u16) -> RotaryResult<u32> {
        let registers = self.read_03(address, 2).await?;
        Ok(codec::decode_unsigned_long_registers(&registers, self.byte_order))
    }

    /// Write a signed 32-bit field in one exchange
    pub async fn write_long(&mut self, address: u16, value: i32) -> RotaryResult<()> {
        let registers = codec::encode_signed_long_registers(value, self.byte_order);
        self.write_10(address, &registers).await
    }

    pub async fn read_float(&mut self, address: u16) -> RotaryResult<f32> {
        let registers = self.read_03(address, 2).await?;
        Ok(codec::decode_float32_registers(&registers, self.byte_order))
    }

    pub async fn write_float(&mut self, address: u16, value: f32) -> RotaryResult<()> {
        let registers = codec::encode_float32_registers(value, self.byte_order);
        self.write_10(address, &registers).await
    }

    /// Read a named field in its wire representation
    pub async fn read_value(&mut self, register: RegisterAddress) -> RotaryResult<RegisterValue> {
        let kind = register.kind();
        let registers = self.read_03(register.offset(), kind.register_count()).await?;
        Ok(RegisterValue::from_registers(kind, &registers, self.byte_order))
    }

    /// Write a named field; the value must match the field's representation
    pub async fn write_value(&mut self, register: RegisterAddress, value: RegisterValue) -> RotaryResult<()> {
        if value.kind() != register.kind() {
            return Err(RotaryError::invalid_data(format!(
                "{} holds {}, got {}",
                register,
                register.kind(),
                value.kind()
            )));
        }
        match value {
            RegisterValue::U16(word) => self.write_register(register.offset(), word).await,
            RegisterValue::I32(_) | RegisterValue::F32(_) => {
                let registers = value.to_registers(self.byte_order);
                self.write_10(register.offset(), &registers).await
            }
        }
    }

    /// Read a contiguous block and decode the named fields inside it
    ///
    /// Used by the poller to fetch several fields in one exchange.
    pub async fn read_block(
        &mut self,
        start: u16,
        fields: &[RegisterAddress],
    ) -> RotaryResult<Vec<RegisterValue>> {
        let end = fields
            .iter()
            .map(|f| f.offset() + f.kind().register_count())
            .max()
            .unwrap_or(start);
        if fields.iter().any(|f| f.offset() < start) || end <= start {
            return Err(RotaryError::invalid_address(start, end.saturating_sub(start)));
        }

        let registers = self.read_03(start, end - start).await?;
        Ok(fields
            .iter()
            .map(|f| {
                let from = (f.offset() - start) as usize;
                let to = from + f.kind().register_count() as usize;
                RegisterValue::from_registers(f.kind(), &registers[from..to], self.byte_order)
            })
            .collect())
    }
}

#[async_trait]
impl<T: ModbusTransport> ModbusClient for RegisterClient<T> {
    async fn read_03(&mut self, address: u16, quantity: u16) -> RotaryResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_REGISTERS_PER_READ {
            return Err(RotaryError::invalid_address(address, quantity));
        }

        let request = ModbusRequest::read_holding(self.slave_id, address, quantity);
        let response = self.execute_request(request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(RotaryError::frame(format!(
                "Expected {} registers, got {}",
                quantity,
                registers.len()
            )));
        }
        Ok(registers)
    }

    async fn write_06(&mut self, address: u16, value: u16) -> RotaryResult<()> {
        registers::check_writable(address, 1)?;

        let request = ModbusRequest::write_single(self.slave_id, address, value);
        let response = self.execute_request(request).await?;
        let (echo_address, echo_value) = response.parse_echo()?;
        if echo_address != address || echo_value != value {
            return Err(RotaryError::protocol(format!(
                "Write echo mismatch: sent {}={}, echoed {}={}",
                address, value, echo_address, echo_value
            )));
        }
        Ok(())
    }

    async fn write_10(&mut self, address: u16, values: &[u16]) -> RotaryResult<()> {
        if values.is_empty() || values.len() > MAX_REGISTERS_PER_WRITE as usize {
            return Err(RotaryError::invalid_address(address, values.len() as u16));
        }
        registers::check_writable(address, values.len() as u16)?;

        let request = ModbusRequest::write_multiple(self.slave_id, address, values);
        let response = self.execute_request(request).await?;
        let (echo_address, echo_quantity) = response.parse_echo()?;
        if echo_address != address || echo_quantity as usize != values.len() {
            return Err(RotaryError::protocol(format!(
                "Write echo mismatch: sent {}x{}, echoed {}x{}",
                address,
                values.len(),
                echo_address,
                echo_quantity
            )));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> RotaryResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Mode;
    use crate::simulator::SimulatedController;

    fn client() -> (RegisterClient<SimulatedController>, SimulatedController) {
        let controller = SimulatedController::new(17);
        (RegisterClient::new(controller.clone(), 17), controller)
    }

    #[tokio::test]
    async fn test_long_round_trip_through_controller() {
        let (mut client, controller) = client();

        client.write_long(RegisterAddress::FinalPosition.offset(), -100_000).await.unwrap();
        assert_eq!(controller.register(4), 0x7960);
        assert_eq!(controller.register(5), 0xFFFE);
        assert_eq!(client.read_long(4).await.unwrap(), -100_000);
        assert_eq!(client.read_unsigned_long(4).await.unwrap(), (-100_000i32) as u32);

        // One write-multiple exchange, not two single writes
        assert_eq!(controller.write_count(RegisterAddress::FinalPosition), 1);
        assert_eq!(controller.write_log(), vec![(4, vec![0x7960, 0xFFFE])]);
    }

    #[tokio::test]
    async fn test_float_and_value_access() {
        let (mut client, controller) = client();

        client.write_float(RegisterAddress::MaxSpeed.offset(), 2400.0).await.unwrap();
        assert_eq!(client.read_float(16).await.unwrap(), 2400.0);

        let value = client.read_value(RegisterAddress::MaxSpeed).await.unwrap();
        assert_eq!(value, RegisterValue::F32(2400.0));

        client
            .write_value(RegisterAddress::Mode, RegisterValue::U16(Mode::Index.code()))
            .await
            .unwrap();
        assert_eq!(controller.mode(), Mode::Index);
        assert_eq!(client.read_register(0).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_sixteen_bit_fields_use_write_multiple() {
        let (mut client, controller) = client();

        client.write_register(RegisterAddress::SpindlePosition.offset(), 3).await.unwrap();
        client
            .write_value(RegisterAddress::Mode, RegisterValue::U16(Mode::Halt.code()))
            .await
            .unwrap();
        assert_eq!(controller.write_log(), vec![(6, vec![3]), (0, vec![0])]);
        assert_eq!(client.read_register(6).await.unwrap(), 3);

        // The controller has no 0x06 handler
        let err = client.write_06(6, 4).await.unwrap_err();
        assert!(matches!(err, RotaryError::Exception { code: 0x01, .. }));
        assert_eq!(controller.register(6), 3);
    }

    #[tokio::test]
    async fn test_value_kind_mismatch_is_refused() {
        let (mut client, controller) = client();
        let err = client
            .write_value(RegisterAddress::MaxSpeed, RegisterValue::I32(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RotaryError::InvalidData { .. }));
        assert_eq!(controller.request_count(), 0);
    }

    #[tokio::test]
    async fn test_reserved_offsets_are_never_written() {
        let (mut client, controller) = client();

        for offset in registers::RESERVED_OFFSETS {
            let err = client.write_register(offset, 1).await.unwrap_err();
            assert!(matches!(err, RotaryError::InvalidAddress { .. }));
        }
        assert!(client.write_long(9, 1).await.is_err());
        assert_eq!(controller.request_count(), 0);
    }

    #[tokio::test]
    async fn test_read_block() {
        let (mut client, controller) = client();
        controller.set_value(RegisterAddress::CurrentPosition, RegisterValue::I32(1600));
        controller.set_value(RegisterAddress::EncoderPosition, RegisterValue::I32(-7));

        let values = client
            .read_block(
                0,
                &[RegisterAddress::Mode, RegisterAddress::CurrentPosition, RegisterAddress::EncoderPosition],
            )
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![RegisterValue::U16(0), RegisterValue::I32(1600), RegisterValue::I32(-7)]
        );
        assert_eq!(controller.request_count(), 1);
    }

    #[tokio::test]
    async fn test_link_failure_surfaces_as_error() {
        let (mut client, controller) = client();
        controller.fail_next(1);
        let err = client.read_register(0).await.unwrap_err();
        assert!(err.is_link_failure());
        assert!(client.read_register(0).await.is_ok());
    }
}
