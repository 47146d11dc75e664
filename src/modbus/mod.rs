pub mod crc;
pub mod protocol;
pub mod rtu;
pub mod values;

pub use crc::{append_crc, crc16_modbus, verify_crc};
pub use protocol::{FunctionCode, ModbusRequest, ModbusResponse, ResponseFault};
pub use rtu::{build_frame, expected_response_length, parse_response};
pub use values::{combine_32bit, split_32bit};
