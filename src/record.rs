use std::io::{Error, ErrorKind, Result};

use crate::raw;
use crate::schema::{ColumnKind, ColumnSchema, RowLayout, SqlType};

/// High bit of a variable-column end offset: the value is stored off-row
/// and the in-row bytes are only a LOB pointer.
pub const VARIABLE_LOB_FLAG: u16 = 0x8000;

/// One decoded column of a row record.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSlice<'a> {
    pub buf: &'a [u8],
    pub lob: bool,
}

fn invalid(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

/// Walk a row record and yield one byte slice per schema entry.
///
/// The record layout is: two status bytes, a u16 pointing at the column
/// count, `static_length` bytes of fixed-width columns (bit columns share a
/// byte per group of eight), the column count, the null bitmap, and -- when
/// the table has variable columns -- a u16 column count followed by that many
/// u16 end offsets (absolute from record start, high bit = LOB) and the
/// variable payloads.
///
/// `record_len` bounds the record inside `buf`; `buf` may extend past it up
/// to the end of the page. Rows whose encoded column count disagrees with
/// the layout are rejected, as is any out-of-bounds region; the caller drops
/// the record and moves on.
pub fn parse_row<'a>(
    buf: &'a [u8],
    record_len: usize,
    layout: &RowLayout,
    schemas: &[ColumnSchema],
    page_size: usize,
) -> Result<Vec<ColumnSlice<'a>>> {
    if buf.len() < 4 || record_len < 4 {
        return Err(invalid("row record shorter than the fixed prefix"));
    }

    let num_col_offset = raw::read_u16(&buf[2..]) as usize;
    if num_col_offset > record_len || num_col_offset + 2 > buf.len() {
        return Err(invalid("column count field out of record bounds"));
    }

    if raw::read_u16(&buf[num_col_offset..]) as usize != layout.total_cols {
        return Err(invalid("row does not match the declared column count"));
    }

    let bitmap_len = raw::null_bitmap_len(layout.total_cols);
    let mut static_offset = 4usize;

    let (mut variable_offset, mut variable_len_cursor) = if layout.variable_cols != 0 {
        let pos = 4 + layout.static_length + 2 + bitmap_len;
        if pos + 2 > buf.len() {
            return Err(invalid("variable column count out of record bounds"));
        }
        let num_variable = raw::read_u16(&buf[pos..]) as usize;
        (pos + 2 + 2 * num_variable, pos + 2)
    } else {
        (0, 0)
    };

    let mut bit_pos = 0usize;
    let mut bit_cols = 0usize;
    let mut columns = Vec::with_capacity(schemas.len());

    for schema in schemas {
        match schema.ty.kind() {
            Some(ColumnKind::Static) if schema.ty == SqlType::Bit => {
                let len = schema.col_size as usize;
                if bit_cols % 8 == 0 {
                    bit_pos = static_offset;
                    static_offset += len;
                }
                bit_cols += 1;

                if bit_pos + len > buf.len() {
                    return Err(invalid("bit column past record end"));
                }
                columns.push(ColumnSlice {
                    buf: &buf[bit_pos..bit_pos + len],
                    lob: false,
                });
            }
            Some(ColumnKind::Static) => {
                let len = schema.col_size as usize;
                if static_offset + len > record_len || static_offset + len > buf.len() {
                    return Err(invalid("static column past record end"));
                }
                if len >= page_size {
                    return Err(invalid("static column larger than a page"));
                }
                columns.push(ColumnSlice {
                    buf: &buf[static_offset..static_offset + len],
                    lob: false,
                });
                static_offset += len;
            }
            Some(ColumnKind::Variable) => {
                if variable_len_cursor + 2 > buf.len() {
                    return Err(invalid("variable end offset out of record bounds"));
                }
                let mut end_offset = raw::read_u16(&buf[variable_len_cursor..]);
                variable_len_cursor += 2;

                let lob = end_offset & VARIABLE_LOB_FLAG != 0;
                if lob {
                    end_offset &= !VARIABLE_LOB_FLAG;
                }
                let end_offset = end_offset as usize;

                if end_offset < variable_offset {
                    return Err(invalid("variable end offsets must not decrease"));
                }
                let len = end_offset - variable_offset;
                if variable_offset >= page_size || end_offset >= page_size || len >= page_size {
                    return Err(invalid("variable column out of page bounds"));
                }
                if variable_offset + len > record_len || end_offset > buf.len() {
                    return Err(invalid("variable column past record end"));
                }

                columns.push(ColumnSlice {
                    buf: &buf[variable_offset..end_offset],
                    lob,
                });
                variable_offset = end_offset;
            }
            // unplaced types decode to an empty literal and consume nothing
            None => columns.push(ColumnSlice { buf: &[], lob: false }),
        }
    }

    Ok(columns)
}

/// Total byte length of a row record, derived from the layout and the
/// record's own variable end-offset array. Returns 0 when the record does
/// not belong to the layout.
pub fn calc_data_record_len(buf: &[u8], layout: &RowLayout) -> usize {
    if buf.len() < 4 {
        return 0;
    }

    let num_col_offset = raw::read_u16(&buf[2..]) as usize;
    if num_col_offset + 2 > buf.len() {
        return 0;
    }
    if raw::read_u16(&buf[num_col_offset..]) as usize != layout.total_cols {
        return 0;
    }

    let fixed = 4 + layout.static_length + 2 + raw::null_bitmap_len(layout.total_cols);

    // status byte A 0x10 / 0x1C marks a row without a variable section
    if layout.variable_cols == 0 || buf[0] == 0x10 || buf[0] == 0x1C {
        return fixed;
    }

    if fixed + 2 > buf.len() {
        return 0;
    }
    let num_variable = raw::read_u16(&buf[fixed..]) as usize;

    // the record ends where its last variable column ends
    let last = fixed + num_variable * 2;
    if last + 2 > buf.len() {
        return 0;
    }

    (raw::read_u16(&buf[last..]) & !VARIABLE_LOB_FLAG) as usize
}
