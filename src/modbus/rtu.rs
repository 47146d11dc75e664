//! Modbus-RTU frame construction and parsing. No serial I/O happens here.

use log::debug;

use super::crc::{append_crc, verify_crc};
use super::protocol::{FunctionCode, ModbusRequest, ModbusResponse, ResponseFault};
use crate::utils::error::ModbusError;

/// Slave + function code + at least one data byte + CRC.
pub const MIN_RESPONSE_LEN: usize = 5;
/// Length of a write echo or fixed-size response.
pub const WRITE_RESPONSE_LEN: usize = 8;

const EXCEPTION_BIT: u8 = 0x80;

/// Builds the complete wire frame (CRC included) for a request.
pub fn build_frame(request: &ModbusRequest) -> Result<Vec<u8>, ModbusError> {
    request.validate()?;

    let mut pdu = vec![request.slave_id, request.function_code.code()];
    pdu.extend_from_slice(&request.address.to_be_bytes());

    match request.function_code {
        FunctionCode::ReadHolding | FunctionCode::ReadInput => {
            pdu.extend_from_slice(&request.count.to_be_bytes());
        }
        FunctionCode::WriteSingle => {
            let value = request.values.first().copied().unwrap_or(0);
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        FunctionCode::WriteMultiple => {
            let count = request.values.len() as u16;
            pdu.extend_from_slice(&count.to_be_bytes());
            pdu.push((count * 2) as u8);
            for value in &request.values {
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    Ok(append_crc(&pdu))
}

/// Builds a frame from a raw function code, rejecting codes this tool does not speak.
pub fn build_frame_for_code(
    slave_id: u8,
    function_code: u8,
    address: u16,
    count: u16,
    values: Vec<u16>,
) -> Result<Vec<u8>, ModbusError> {
    let function_code = FunctionCode::try_from(function_code)?;
    build_frame(&ModbusRequest {
        slave_id,
        function_code,
        address,
        count,
        values,
    })
}

/// Parses a received frame. `raw_tx` and `timestamp` are left for the caller to fill.
pub fn parse_response(raw: &[u8], request: &ModbusRequest) -> ModbusResponse {
    if raw.len() < MIN_RESPONSE_LEN {
        let mut resp = ModbusResponse::new(raw.first().copied().unwrap_or(0), 0, raw);
        resp.fault = Some(ResponseFault::FrameTooShort);
        return resp;
    }

    let mut resp = ModbusResponse::new(raw[0], raw[1], raw);

    if !verify_crc(raw) {
        debug!("CRC mismatch on response to slave {}", request.slave_id);
        resp.fault = Some(ResponseFault::CrcMismatch);
        return resp;
    }

    if raw[1] & EXCEPTION_BIT != 0 {
        resp.function_code = raw[1] & !EXCEPTION_BIT;
        resp.fault = Some(ResponseFault::Exception(raw[2]));
        resp.data = raw[2..3].to_vec();
        return resp;
    }

    match FunctionCode::try_from(raw[1]) {
        Ok(FunctionCode::ReadHolding) | Ok(FunctionCode::ReadInput) => {
            let byte_count = raw[2] as usize;
            let end = (3 + byte_count).min(raw.len());
            resp.data = raw[3..end].to_vec();
            if resp.data.len() < byte_count {
                resp.fault = Some(ResponseFault::FrameTooShort);
                return resp;
            }
            // A trailing odd byte is dropped.
            resp.values = resp
                .data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
        }
        Ok(FunctionCode::WriteSingle) | Ok(FunctionCode::WriteMultiple) => {
            if raw.len() < WRITE_RESPONSE_LEN {
                resp.fault = Some(ResponseFault::FrameTooShort);
                return resp;
            }
            resp.data = raw[2..6].to_vec();
            // Only the value (0x06) or register count (0x10) half of the echo is surfaced.
            resp.values = vec![u16::from_be_bytes([raw[4], raw[5]])];
        }
        Err(_) => {
            debug!("Response carries unhandled function code 0x{:02X}", raw[1]);
        }
    }

    resp
}

/// Number of bytes the worker should wait for after sending `request`.
pub fn expected_response_length(request: &ModbusRequest) -> usize {
    match request.function_code {
        FunctionCode::ReadHolding | FunctionCode::ReadInput => 5 + request.count as usize * 2,
        FunctionCode::WriteSingle | FunctionCode::WriteMultiple => WRITE_RESPONSE_LEN,
    }
}
