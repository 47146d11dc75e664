use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::utils::error::ModbusError;

/// Largest register count a single read can return (250 data bytes).
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest register count a single 0x10 write can carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Unicast slave addresses. 0 is broadcast and never answers.
pub const SLAVE_ID_RANGE: std::ops::RangeInclusive<u8> = 1..=247;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FunctionCode {
    ReadHolding,
    ReadInput,
    WriteSingle,
    WriteMultiple,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHolding => 0x03,
            FunctionCode::ReadInput => 0x04,
            FunctionCode::WriteSingle => 0x06,
            FunctionCode::WriteMultiple => 0x10,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, FunctionCode::ReadHolding | FunctionCode::ReadInput)
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ModbusError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x03 => Ok(FunctionCode::ReadHolding),
            0x04 => Ok(FunctionCode::ReadInput),
            0x06 => Ok(FunctionCode::WriteSingle),
            0x10 => Ok(FunctionCode::WriteMultiple),
            other => Err(ModbusError::UnsupportedFunction(other)),
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::ReadHolding => "Read Holding Registers",
            FunctionCode::ReadInput => "Read Input Registers",
            FunctionCode::WriteSingle => "Write Single Register",
            FunctionCode::WriteMultiple => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// One master request. Built per exchange and consumed by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModbusRequest {
    pub slave_id: u8,
    pub function_code: FunctionCode,
    pub address: u16,
    pub count: u16,
    pub values: Vec<u16>,
}

impl ModbusRequest {
    pub fn read_holding(slave_id: u8, address: u16, count: u16) -> Self {
        Self {
            slave_id,
            function_code: FunctionCode::ReadHolding,
            address,
            count,
            values: Vec::new(),
        }
    }

    pub fn read_input(slave_id: u8, address: u16, count: u16) -> Self {
        Self {
            slave_id,
            function_code: FunctionCode::ReadInput,
            address,
            count,
            values: Vec::new(),
        }
    }

    pub fn write_single(slave_id: u8, address: u16, value: u16) -> Self {
        Self {
            slave_id,
            function_code: FunctionCode::WriteSingle,
            address,
            count: 1,
            values: vec![value],
        }
    }

    pub fn write_multiple(slave_id: u8, address: u16, values: Vec<u16>) -> Self {
        Self {
            slave_id,
            function_code: FunctionCode::WriteMultiple,
            address,
            count: values.len() as u16,
            values,
        }
    }

    /// Checks the protocol-level limits of the request. Application bounds
    /// (register min/max) are not checked here.
    pub fn validate(&self) -> Result<(), ModbusError> {
        if !SLAVE_ID_RANGE.contains(&self.slave_id) {
            return Err(ModbusError::InvalidRequest(format!(
                "slave id {} outside {}..={}",
                self.slave_id,
                SLAVE_ID_RANGE.start(),
                SLAVE_ID_RANGE.end()
            )));
        }
        match self.function_code {
            FunctionCode::ReadHolding | FunctionCode::ReadInput => {
                if self.count == 0 || self.count > MAX_READ_REGISTERS {
                    return Err(ModbusError::InvalidRequest(format!(
                        "read count {} outside 1..={}",
                        self.count, MAX_READ_REGISTERS
                    )));
                }
            }
            FunctionCode::WriteSingle => {}
            FunctionCode::WriteMultiple => {
                if self.values.is_empty() || self.values.len() > MAX_WRITE_REGISTERS as usize {
                    return Err(ModbusError::InvalidRequest(format!(
                        "write of {} registers outside 1..={}",
                        self.values.len(),
                        MAX_WRITE_REGISTERS
                    )));
                }
                if self.count as usize != self.values.len() {
                    return Err(ModbusError::InvalidRequest(format!(
                        "count {} does not match {} values",
                        self.count,
                        self.values.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-exchange fault. Integer codes match the values external consumers expect:
/// transport faults are negative, device exceptions positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseFault {
    CrcMismatch,
    Timeout,
    FrameTooShort,
    /// Device exception code as sent by the slave. A slave that answers with
    /// code 0 still yields a fault, even though `code()` and
    /// `ModbusResponse::fault_code()` then report 0; test faults with
    /// `is_fault()`, not with the integer code.
    Exception(u8),
}

impl ResponseFault {
    pub const CRC_MISMATCH_CODE: i32 = -1;
    pub const TIMEOUT_CODE: i32 = -2;
    pub const FRAME_TOO_SHORT_CODE: i32 = -3;

    pub fn code(self) -> i32 {
        match self {
            ResponseFault::CrcMismatch => Self::CRC_MISMATCH_CODE,
            ResponseFault::Timeout => Self::TIMEOUT_CODE,
            ResponseFault::FrameTooShort => Self::FRAME_TOO_SHORT_CODE,
            ResponseFault::Exception(code) => code as i32,
        }
    }

    pub fn is_transport(self) -> bool {
        !matches!(self, ResponseFault::Exception(_))
    }
}

impl fmt::Display for ResponseFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseFault::CrcMismatch => write!(f, "CRC check failed"),
            ResponseFault::Timeout => write!(f, "No response (timeout)"),
            ResponseFault::FrameTooShort => write!(f, "Frame too short"),
            ResponseFault::Exception(code) => write!(
                f,
                "Modbus exception 0x{:02X}: {}",
                code,
                crate::devices::error_codes::exception_text(*code)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModbusResponse {
    pub slave_id: u8,
    /// Echoed function code, with the exception bit already stripped.
    pub function_code: u8,
    pub data: Vec<u8>,
    pub values: Vec<u16>,
    pub fault: Option<ResponseFault>,
    pub raw_tx: Vec<u8>,
    pub raw_rx: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ModbusResponse {
    pub(crate) fn new(slave_id: u8, function_code: u8, raw_rx: &[u8]) -> Self {
        Self {
            slave_id,
            function_code,
            data: Vec::new(),
            values: Vec::new(),
            fault: None,
            raw_tx: Vec::new(),
            raw_rx: raw_rx.to_vec(),
            timestamp: None,
        }
    }

    /// Response synthesised when the channel returned nothing before its read timeout.
    pub fn timeout(request: &ModbusRequest, raw_tx: Vec<u8>) -> Self {
        Self {
            slave_id: request.slave_id,
            function_code: request.function_code.code(),
            data: Vec::new(),
            values: Vec::new(),
            fault: Some(ResponseFault::Timeout),
            raw_tx,
            raw_rx: Vec::new(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    /// 0 for a good response, otherwise the fault's integer code. An
    /// exception with code 0 also reports 0 here.
    pub fn fault_code(&self) -> i32 {
        self.fault.map(ResponseFault::code).unwrap_or(0)
    }

    /// Start address of the request that produced this response, read back from the sent frame.
    pub fn request_address(&self) -> Option<u16> {
        if self.raw_tx.len() >= 4 {
            Some(u16::from_be_bytes([self.raw_tx[2], self.raw_tx[3]]))
        } else {
            None
        }
    }
}
