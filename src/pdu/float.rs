//! Floating point time codes of IGMPv3 (RFC 3376 4.1.1) and MLDv2 (RFC 3810 5.1.3).

/// Largest value an 8-bit code can express.
pub const MAX_8BIT: u32 = 31744;

/// Largest value a 16-bit code can express.
pub const MAX_16BIT: u32 = 8387584;

pub fn decode8(code: u8) -> u32 {
    if code < 0x80 {
        return code as u32;
    }
    let exp = ((code >> 4) & 0x07) as u32;
    let mant = (code & 0x0f) as u32;
    (mant | 0x10) << (exp + 3)
}

/// Values above the range saturate to 0xff. Bits below the mantissa are truncated.
pub fn encode8(value: u32) -> u8 {
    if value < 0x80 {
        return value as u8;
    }
    if value > MAX_8BIT {
        return 0xff;
    }
    for exp in (0..8u32).rev() {
        let base = 0x10 << (exp + 3);
        if value >= base {
            return 0x80 | (exp << 4) as u8 | (((value - base) >> (exp + 3)) & 0x0f) as u8;
        }
    }
    0xff
}

pub fn decode16(code: u16) -> u32 {
    if code < 0x8000 {
        return code as u32;
    }
    let exp = ((code >> 12) & 0x07) as u32;
    let mant = (code & 0x0fff) as u32;
    (mant | 0x1000) << (exp + 3)
}

pub fn encode16(value: u32) -> u16 {
    if value < 0x8000 {
        return value as u16;
    }
    if value >= MAX_16BIT {
        return 0xffff;
    }
    for exp in (0..8u32).rev() {
        let base = 0x1000 << (exp + 3);
        if value >= base {
            return 0x8000 | (exp << 12) as u16 | (((value - base) >> (exp + 3)) & 0x0fff) as u16;
        }
    }
    0xffff
}
