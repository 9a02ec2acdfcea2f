//! CRC-16 trailer (polynomial 0xA001 reflected, initial value 0xFFFF).

/// Compute the frame CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            let carry = crc & 1 != 0;
            crc >>= 1;
            if carry {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

/// Check `data` against an expected CRC.
pub fn verify(data: &[u8], expected: u16) -> bool {
    crc16(data) == expected
}
