pub mod error_codes;
pub mod motor;
pub mod registers;

pub use error_codes::{error_text, exception_text};
pub use motor::{MotorEvent, MotorService, MotorState, MotorStatus, RunMode};
pub use registers::{get_register, DataType, RegisterDef, RegisterType};
