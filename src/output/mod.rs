pub mod formatters;

pub use formatters::{
    formatter_for, ConsoleFormatter, Direction, HexFormatter, JsonFormatter, ResponseFormatter,
};
