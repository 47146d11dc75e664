//! Modbus CRC16 (polynomial 0xA001, initial value 0xFFFF, LSB first).

const POLY: u16 = 0xA001;

pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Returns `data` followed by its CRC, low byte first.
pub fn append_crc(data: &[u8]) -> Vec<u8> {
    let crc = crc16_modbus(data);
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Checks the trailing two CRC bytes of a complete frame.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    crc16_modbus(&frame[..data_len]) == received
}
