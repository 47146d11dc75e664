//! Human readable text for drive alarm codes and Modbus exception codes.

const ERROR_CODES: &[(u16, &str)] = &[
    (0x2200, "Over-current protection"),
    (0x3110, "Supply over-voltage"),
    (0x3120, "Supply under-voltage"),
    (0x4310, "Over-temperature alarm"),
    (0x7121, "Stall alarm"),
    (0x8612, "Limit switch alarm"),
    (0xFF00, "Over-temperature shutdown"),
    (0xFF01, "Invalid command"),
    (0xFF02, "Command cannot be executed"),
    (0xFF0E, "Negative limit exceeded"),
    (0xFF0F, "Positive limit exceeded"),
    (0xFF11, "SPI communication failure"),
];

const MODBUS_EXCEPTIONS: &[(u8, &str)] = &[
    (0x01, "Illegal function"),
    (0x02, "Illegal data address"),
    (0x03, "Illegal data value"),
    (0x04, "Slave device failure"),
    (0x05, "Acknowledge (processing)"),
    (0x06, "Slave device busy"),
];

/// Text for an alarm code read from the drive's alarm register.
pub fn error_text(code: u16) -> String {
    ERROR_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| text.to_string())
        .unwrap_or_else(|| format!("Unknown error (0x{:04X})", code))
}

pub fn exception_text(code: u8) -> String {
    MODBUS_EXCEPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| text.to_string())
        .unwrap_or_else(|| format!("Unknown exception (0x{:02X})", code))
}
