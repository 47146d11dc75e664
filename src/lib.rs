//! Modbus-RTU engine for debugging integrated stepper-motor drives.
//!
//! Layers, bottom up: CRC and frame codec (`modbus`), the serial channel and
//! the single-writer communication worker (`comm`), request/response sessions
//! on top of the worker (`services`), and drive-specific glue (`devices`).

pub mod cli;
pub mod comm;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use comm::{CommEvent, CommWorker, SerialChannel, SerialPortChannel};
pub use config::Config;
pub use devices::{MotorEvent, MotorService, MotorStatus};
pub use modbus::{FunctionCode, ModbusRequest, ModbusResponse, ResponseFault};
pub use output::{ConsoleFormatter, HexFormatter, JsonFormatter, ResponseFormatter};
pub use services::{ModbusSession, ModbusTransport};
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
