//! CRC-16 used by SSP packets.
//!
//! Polynomial 0x8005, seed 0xFFFF, MSB first, no reflection and no final
//! XOR. The checksum covers everything between STX and the CRC itself
//! (SEQ/ADDR, LEN, DATA) and goes on the wire low byte first.

/// SSP CRC polynomial.
pub const POLY: u16 = 0x8005;

/// SSP CRC seed.
pub const SEED: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the SSP CRC-16 of `data`.
pub fn crc16_ssp(data: &[u8]) -> u16 {
    data.iter().fold(SEED, |crc, &byte| {
        (crc << 8) ^ TABLE[usize::from((crc >> 8) as u8 ^ byte)]
    })
}
