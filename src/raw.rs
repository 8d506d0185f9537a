// Field readers for the on-disk formats.
use std::io::{Error, ErrorKind, Result};

use byteorder::{ByteOrder, LittleEndian};

// SQL Server writes every multi-byte field little-endian.
type E = LittleEndian;

pub fn read_u16(buf: &[u8]) -> u16 {
    E::read_u16(buf)
}

pub fn read_u32(buf: &[u8]) -> u32 {
    E::read_u32(buf)
}

pub fn read_i32(buf: &[u8]) -> i32 {
    E::read_i32(buf)
}

pub fn read_u64(buf: &[u8]) -> u64 {
    E::read_u64(buf)
}

pub fn read_f32(buf: &[u8]) -> f32 {
    E::read_f32(buf)
}

pub fn read_f64(buf: &[u8]) -> f64 {
    E::read_f64(buf)
}

/// Round a length up to the next multiple of four.
#[inline]
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Number of bytes a null bitmap occupies for the given column count.
#[inline]
pub const fn null_bitmap_len(cols: usize) -> usize {
    (cols + 7) >> 3
}

/// Decode a UTF-16LE string field.
pub fn read_utf16(buf: &[u8]) -> Result<String> {
    if buf.len() % 2 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "odd byte count in UTF-16 field",
        ));
    }

    let units: Vec<u16> = buf.chunks_exact(2).map(read_u16).collect();

    String::from_utf16(&units)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid UTF-16 field"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);
        assert_eq!(align4(8), 8);
    }

    #[test]
    fn test_null_bitmap_len() {
        assert_eq!(null_bitmap_len(0), 0);
        assert_eq!(null_bitmap_len(1), 1);
        assert_eq!(null_bitmap_len(8), 1);
        assert_eq!(null_bitmap_len(9), 2);
    }

    #[test]
    fn test_read_utf16() {
        let buf: Vec<u8> = "name"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(read_utf16(&buf).unwrap(), "name");
        assert!(read_utf16(&buf[1..]).is_err());
    }
}
