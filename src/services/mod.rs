pub mod session;

pub use session::{EventObserver, ModbusSession, ModbusTransport};
