use std::io::{Error, ErrorKind, Result};

use crate::raw;
use crate::record::ColumnSlice;
use crate::schema::{ColumnSchema, SqlType};

fn invalid(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

fn expect_len(buf: &[u8], len: usize) -> Result<&[u8]> {
    if buf.len() != len {
        return Err(invalid("column width does not match its type"));
    }
    Ok(buf)
}

/// Hex form of the column bytes reversed, as T-SQL renders fixed-width
/// date/time and money literals.
fn reversed_hex(buf: &[u8]) -> String {
    let mut bytes = buf.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

/// Render one column as a SQL literal, CAST, or CONVERT expression.
///
/// Types that cannot be recovered from in-row bytes (bit, uniqueidentifier,
/// LOB-only types, sql_variant and friends) render as an empty string; a
/// buffer that does not fit its declared type fails the whole record.
pub fn decode(col: &ColumnSlice<'_>, schema: &ColumnSchema) -> Result<String> {
    let buf = col.buf;

    let out = match schema.ty {
        SqlType::TinyInt => expect_len(buf, 1)?[0].to_string(),
        SqlType::SmallInt => raw::read_u16(expect_len(buf, 2)?).to_string(),
        SqlType::Int => format!("'{}'", raw::read_u32(expect_len(buf, 4)?)),
        SqlType::BigInt => raw::read_u64(expect_len(buf, 8)?).to_string(),
        SqlType::Real => raw::read_f32(expect_len(buf, 4)?).to_string(),
        SqlType::Float => raw::read_f64(expect_len(buf, 8)?).to_string(),
        SqlType::DateTime | SqlType::SmallDateTime | SqlType::Money | SqlType::SmallMoney => {
            format!("cast(0x{} as {})", reversed_hex(buf), schema.ty.name())
        }
        SqlType::Date => format!("cast(0x{} as date)", hex::encode(buf)),
        SqlType::Time | SqlType::DateTime2 | SqlType::DateTimeOffset | SqlType::Timestamp => {
            format!("cast(0x{:02x}{} as time)", schema.scale, hex::encode(buf))
        }
        SqlType::Numeric | SqlType::Decimal => {
            if buf.is_empty() {
                return Err(invalid("empty numeric column"));
            }
            // the leading byte is the stored sign; the literal re-encodes it
            // as the canonical 0x...0001 prefix
            format!(
                "convert({},0x{:02x}{:02x}0001{})",
                schema.declared_type(),
                schema.precision,
                schema.scale,
                hex::encode(&buf[1..])
            )
        }
        SqlType::Char => {
            let s = std::str::from_utf8(buf).map_err(|_| invalid("invalid UTF-8 in char"))?;
            format!("'{s}'")
        }
        SqlType::VarChar => {
            if col.lob {
                String::new()
            } else {
                format!("'{}'", String::from_utf8_lossy(buf))
            }
        }
        SqlType::NChar => format!("'{}'", raw::read_utf16(buf)?),
        SqlType::NVarChar => {
            if col.lob {
                String::new()
            } else {
                format!("'{}'", raw::read_utf16(buf)?)
            }
        }
        SqlType::Binary => format!("0x{}", hex::encode(buf)),
        SqlType::VarBinary => {
            if col.lob {
                "0x".to_string()
            } else {
                format!("0x{}", hex::encode(buf))
            }
        }
        _ => String::new(),
    };

    Ok(out)
}
