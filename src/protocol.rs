//! Modbus application layer: function codes, requests and responses
//!
//! TCP and RTU carry the same PDU; only the envelope differs
//! (MBAP header vs. slave address + CRC). Requests render their PDU with
//! [`ModbusRequest::encode_pdu`] and transports parse replies with
//! [`ModbusResponse::from_pdu`].

use bytes::{BufMut, BytesMut};

use crate::constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// Slave / unit identifier on the bus.
pub type SlaveId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(code)),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }
}

/// One request as handed to a transport.
///
/// `data` holds the payload after address/quantity: the register value for
/// FC06, `[0xFF, 0x00]`/`[0x00, 0x00]` for FC05, packed bytes for FC0F/FC10.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    pub fn new_write_registers(slave_id: SlaveId, address: u16, values: &[u16]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 2);
        for value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }
        let function = if values.len() == 1 {
            ModbusFunction::WriteSingleRegister
        } else {
            ModbusFunction::WriteMultipleRegisters
        };
        Self {
            slave_id,
            function,
            address,
            quantity: values.len() as u16,
            data,
        }
    }

    /// Check quantities against the protocol ceilings.
    pub fn validate(&self) -> ModbusResult<()> {
        let limit = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => MAX_READ_COILS,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            ModbusFunction::WriteMultipleCoils => MAX_WRITE_COILS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if self.quantity == 0 || self.quantity > limit {
            return Err(ModbusError::invalid_data(format!(
                "Invalid quantity {} for FC{:02X} (1..={})",
                self.quantity,
                self.function.to_u8(),
                limit
            )));
        }
        if matches!(self.function, ModbusFunction::WriteSingleRegister) && self.data.len() != 2 {
            return Err(ModbusError::invalid_data("FC06 needs exactly one register"));
        }
        Ok(())
    }

    /// Render the PDU (function code onwards).
    pub fn encode_pdu(&self) -> ModbusResult<BytesMut> {
        self.validate()?;
        let mut pdu = BytesMut::with_capacity(6 + self.data.len());
        pdu.put_u8(self.function.to_u8());
        pdu.put_u16(self.address);
        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => pdu.put_u16(self.quantity),
            ModbusFunction::WriteSingleCoil => {
                let on = self.data.first().copied().unwrap_or(0) != 0;
                pdu.put_u16(if on { 0xFF00 } else { 0x0000 });
            }
            ModbusFunction::WriteSingleRegister => pdu.put_slice(&self.data),
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                pdu.put_u16(self.quantity);
                pdu.put_u8(self.data.len() as u8);
                pdu.put_slice(&self.data);
            }
        }
        if pdu.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                pdu.len(),
                MAX_PDU_SIZE
            )));
        }
        Ok(pdu)
    }
}

/// A parsed reply. Exception replies keep the exception code.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    data: Vec<u8>,
    exception: Option<u8>,
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

    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception: Some(code),
        }
    }

    /// Parse a reply PDU received from `slave_id`.
    pub fn from_pdu(slave_id: SlaveId, pdu: &[u8]) -> ModbusResult<Self> {
        let (&fc, rest) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty response PDU"))?;
        if fc & 0x80 != 0 {
            let code = rest
                .first()
                .copied()
                .ok_or_else(|| ModbusError::frame("Exception response without code"))?;
            return Ok(Self::new_exception(
                slave_id,
                ModbusFunction::from_u8(fc & 0x7F)?,
                code,
            ));
        }
        Ok(Self::new_success(
            slave_id,
            ModbusFunction::from_u8(fc)?,
            rest.to_vec(),
        ))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception
            .map(|code| ModbusError::exception(self.function.to_u8(), code))
    }

    /// Register values of an FC03/FC04 reply (skips the byte count).
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let payload = self.counted_payload()?;
        if payload.len() % 2 != 0 {
            return Err(ModbusError::frame(format!(
                "Odd register payload length {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Bit values of an FC01/FC02 reply, LSB first, padded to whole bytes.
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        let payload = self.counted_payload()?;
        Ok(payload
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
            .collect())
    }

    fn counted_payload(&self) -> ModbusResult<&[u8]> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }
        let (&count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::frame("Missing byte count"))?;
        if payload.len() < count as usize {
            return Err(ModbusError::frame(format!(
                "Byte count {} exceeds payload {}",
                count,
                payload.len()
            )));
        }
        Ok(&payload[..count as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_pdu() {
        let req = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0x006B, 3);
        assert_eq!(req.encode_pdu().unwrap().as_ref(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_write_request_pdu() {
        let single = ModbusRequest::new_write_registers(1, 40, &[0x1234]);
        assert_eq!(single.function, ModbusFunction::WriteSingleRegister);
        assert_eq!(single.encode_pdu().unwrap().as_ref(), &[0x06, 0x00, 0x28, 0x12, 0x34]);

        let multi = ModbusRequest::new_write_registers(1, 40, &[0x0001, 0x0002]);
        assert_eq!(
            multi.encode_pdu().unwrap().as_ref(),
            &[0x10, 0x00, 0x28, 0x00, 0x02, 0x04, 0x00, 0x01, 0x00, 0x02]
        );
    }

    #[test]
    fn test_quantity_limits() {
        let too_many = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 0, 126);
        assert!(too_many.validate().is_err());

        let zero = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 0, 0);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_parse_registers() {
        let resp = ModbusResponse::from_pdu(1, &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(resp.parse_registers().unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_parse_bits() {
        let resp = ModbusResponse::from_pdu(1, &[0x01, 0x01, 0b0000_0101]).unwrap();
        let bits = resp.parse_bits().unwrap();
        assert_eq!(&bits[..3], &[true, false, true]);
    }

    #[test]
    fn test_exception_response() {
        let resp = ModbusResponse::from_pdu(7, &[0x83, 0x02]).unwrap();
        assert!(resp.is_exception());
        assert_eq!(resp.get_exception(), Some(ModbusError::exception(0x03, 0x02)));
        assert!(resp.parse_registers().is_err());
    }
}
