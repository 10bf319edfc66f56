//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no xorout).

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

/// Compute the CRC-16/CCITT-FALSE checksum of `data`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}
