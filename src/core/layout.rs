// Little-endian field accessors, alignment, checksums, and wall-clock helpers
// shared by the registry, segment, entry, and event layouts.
use std::time::{SystemTime, UNIX_EPOCH};

pub fn align8(value: usize) -> usize {
    (value + 7) & !7
}

pub fn round_up(value: u64, granularity: u64) -> u64 {
    if granularity == 0 {
        return value;
    }
    value.div_ceil(granularity) * granularity
}

/// CRC-32 (IEEE) over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut out = [0u8; 2];
    out.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(out)
}

pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{align8, crc32, read_u32, read_u64, round_up, write_u32, write_u64};

    #[test]
    fn alignment_is_8_bytes() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn round_up_to_granularity() {
        assert_eq!(round_up(1, 1024), 1024);
        assert_eq!(round_up(1024, 1024), 1024);
        assert_eq!(round_up(1025, 1024), 2048);
        assert_eq!(round_up(7, 0), 7);
    }

    #[test]
    fn crc32_matches_ieee_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn fields_are_little_endian() {
        let mut buf = [0u8; 16];
        write_u32(&mut buf, 0, 0x0102_0304);
        write_u64(&mut buf, 8, 42);
        assert_eq!(buf[0], 0x04);
        assert_eq!(read_u32(&buf, 0), 0x0102_0304);
        assert_eq!(read_u64(&buf, 8), 42);
    }
}
