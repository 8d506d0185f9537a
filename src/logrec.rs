use std::io::{Error, ErrorKind, Result};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tracing::debug;

use crate::{BLOCK_SIZE, Lsn, raw};
use crate::filebuf::FileBuf;
use crate::page;
use crate::vlf::VlfInfo;

/// Log operation codes as stored in the op byte of a log record.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    LOP_FORMAT_PAGE = 1,
    LOP_INSERT_ROWS = 2,
    LOP_DELETE_ROWS = 3,
    LOP_MODIFY_ROW = 4,
    LOP_MODIFY_HEADER = 5,
    LOP_MODIFY_COLUMNS = 6,
    LOP_SET_BITS = 7,
    LOP_DELTA_SYSIND = 9,
    LOP_SET_FREE_SPACE = 10,
    LOP_DELETE_SPLIT = 11,
    LOP_UNDO_DELETE_SPLIT = 12,
    LOP_EXPUNGE_ROWS = 13,
    LOP_FILE_HDR_MODIFY = 16,
    LOP_SET_GAM_BITS = 17,
    LOP_INSYSXACT = 22,
    LOP_BEGIN_XACT = 128,
    LOP_COMMIT_XACT = 129,
    LOP_ABORT_XACT = 130,
    LOP_PREP_XACT = 131,
    LOP_MARK_SAVEPOINT = 132,
    LOP_FORGET_XACT = 133,
    LOP_CREATE_FILE = 134,
    LOP_DROP_FILE = 135,
    LOP_MARK_DDL = 136,
    LOP_HOBT_DELTA = 140,
    LOP_LOCK_XACT = 141,
    LOP_BEGIN_CKPT = 150,
    LOP_XACT_CKPT = 152,
    LOP_END_CKPT = 153,
    LOP_BUF_WRITE = 154,
    LOP_IDENTITY_TYPE = 155,
    LOP_BEGIN_RECOVERY = 160,
    LOP_END_RECOVERY = 161,
    LOP_NONLOGGED_OP = 162,
    LOP_SORT_BEGIN = 170,
    LOP_SORT_END = 171,
    LOP_SORT_EXTENT = 172,
    LOP_CREATE_INDEX = 173,
    LOP_DROP_INDEX = 174,
    LOP_SORT_MEMORY = 175,
    LOP_REPL_COMMAND = 200,
    LOP_BEGIN_UPDATE = 201,
    LOP_END_UPDATE = 202,
    LOP_TEXT_POINTER = 203,
    LOP_TEXT_INFO_BEGIN = 204,
    LOP_TEXT_INFO_END = 205,
    LOP_REPL_NOOP = 206,
    LOP_TEXT_VALUE = 207,
    LOP_SHRINK_NOOP = 211,
}

impl LogOp {
    pub fn from_u8(op: u8) -> Option<LogOp> {
        use LogOp::*;

        Some(match op {
            1 => LOP_FORMAT_PAGE,
            2 => LOP_INSERT_ROWS,
            3 => LOP_DELETE_ROWS,
            4 => LOP_MODIFY_ROW,
            5 => LOP_MODIFY_HEADER,
            6 => LOP_MODIFY_COLUMNS,
            7 => LOP_SET_BITS,
            9 => LOP_DELTA_SYSIND,
            10 => LOP_SET_FREE_SPACE,
            11 => LOP_DELETE_SPLIT,
            12 => LOP_UNDO_DELETE_SPLIT,
            13 => LOP_EXPUNGE_ROWS,
            16 => LOP_FILE_HDR_MODIFY,
            17 => LOP_SET_GAM_BITS,
            22 => LOP_INSYSXACT,
            128 => LOP_BEGIN_XACT,
            129 => LOP_COMMIT_XACT,
            130 => LOP_ABORT_XACT,
            131 => LOP_PREP_XACT,
            132 => LOP_MARK_SAVEPOINT,
            133 => LOP_FORGET_XACT,
            134 => LOP_CREATE_FILE,
            135 => LOP_DROP_FILE,
            136 => LOP_MARK_DDL,
            140 => LOP_HOBT_DELTA,
            141 => LOP_LOCK_XACT,
            150 => LOP_BEGIN_CKPT,
            152 => LOP_XACT_CKPT,
            153 => LOP_END_CKPT,
            154 => LOP_BUF_WRITE,
            155 => LOP_IDENTITY_TYPE,
            160 => LOP_BEGIN_RECOVERY,
            161 => LOP_END_RECOVERY,
            162 => LOP_NONLOGGED_OP,
            170 => LOP_SORT_BEGIN,
            171 => LOP_SORT_END,
            172 => LOP_SORT_EXTENT,
            173 => LOP_CREATE_INDEX,
            174 => LOP_DROP_INDEX,
            175 => LOP_SORT_MEMORY,
            200 => LOP_REPL_COMMAND,
            201 => LOP_BEGIN_UPDATE,
            202 => LOP_END_UPDATE,
            203 => LOP_TEXT_POINTER,
            204 => LOP_TEXT_INFO_BEGIN,
            205 => LOP_TEXT_INFO_END,
            206 => LOP_REPL_NOOP,
            207 => LOP_TEXT_VALUE,
            211 => LOP_SHRINK_NOOP,
            _ => return None,
        })
    }
}

impl std::fmt::Display for LogOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Log context codes (the allocation structure a record applies to).
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogContext {
    LCX_NULL = 0,
    LCX_HEAP = 1,
    LCX_CLUSTERED = 2,
    LCX_INDEX_LEAF = 3,
    LCX_INDEX_INTERIOR = 4,
    LCX_GAM = 8,
    LCX_IAM = 10,
    LCX_PFS = 11,
    LCX_BOOT_PAGE_CKPT = 23,
}

impl LogContext {
    pub fn from_u8(context: u8) -> Option<LogContext> {
        use LogContext::*;

        Some(match context {
            0 => LCX_NULL,
            1 => LCX_HEAP,
            2 => LCX_CLUSTERED,
            3 => LCX_INDEX_LEAF,
            4 => LCX_INDEX_INTERIOR,
            8 => LCX_GAM,
            10 => LCX_IAM,
            11 => LCX_PFS,
            23 => LCX_BOOT_PAGE_CKPT,
            _ => return None,
        })
    }
}

/// One parsed log record.
///
/// The DML fields (`page_id`, `slot_id`, `partition_id`, `offset_in_row`,
/// `row_log_content`) are populated only for INSERT/DELETE/MODIFY ops;
/// `begin_time`/`end_time` only for BEGIN_XACT/COMMIT_XACT. Records with an
/// unknown op byte still carry the prologue so they can contribute
/// transaction boundaries.
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    pub vlf_seqnum: u32,
    pub block_num: usize,
    pub slot_num: usize,
    /// Offset inside the segment (structured walk) or the file (carving).
    pub offset: usize,
    pub length: usize,
    pub fixed_length: u16,
    pub previous_lsn: Lsn,
    pub flag_bits: u16,
    pub transaction_id: [u8; 6],
    pub op: u8,
    pub context: u8,
    pub page_id: (u32, u16),
    pub slot_id: u16,
    pub offset_in_row: u16,
    pub partition_id: u64,
    pub num_elements: u8,
    pub row_log_content: Vec<Vec<u8>>,
    pub begin_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
}

impl LogRecord {
    pub fn is_dml(&self) -> bool {
        matches!(
            LogOp::from_u8(self.op),
            Some(LogOp::LOP_INSERT_ROWS | LogOp::LOP_DELETE_ROWS | LogOp::LOP_MODIFY_ROW)
        )
    }
}

/// Transaction timestamps count days and 1/300-second ticks from the start
/// of 1900.
pub fn xact_time(days: i32, ticks: i32) -> Option<NaiveDateTime> {
    let anchor = NaiveDate::from_ymd_opt(1900, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let micros = (ticks as i64) * 10_000 / 3;

    anchor
        .checked_add_signed(TimeDelta::try_days(days as i64)?)?
        .checked_add_signed(TimeDelta::microseconds(micros))
}

pub fn format_xact_time(t: &NaiveDateTime) -> String {
    t.format("%m/%d/%Y %H:%M:%S%.6f").to_string()
}

/// Parse one log record from the start of `buf`.
///
/// Prologue: fixed length u16 @0x02, previous LSN @0x04, flag bits @0x0E,
/// transaction id @0x10, op @0x16, context @0x17. DML records continue with
/// page id @0x18, slot id @0x1E, partition id @0x30, offset-in-row @0x38 and
/// `numelements` row-log-content fragments (u16 lengths at 0x40, then the
/// fragments, everything padded to 4-byte multiples).
pub fn parse_record(buf: &[u8]) -> Result<LogRecord> {
    if buf.len() < 0x18 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "short log record"));
    }

    let mut rec = LogRecord {
        fixed_length: raw::read_u16(&buf[0x02..]),
        previous_lsn: Lsn::read(&buf[0x04..]),
        flag_bits: raw::read_u16(&buf[0x0E..]),
        op: buf[0x16],
        context: buf[0x17],
        ..LogRecord::default()
    };
    rec.transaction_id.copy_from_slice(&buf[0x10..0x16]);

    // BEGIN and COMMIT keep their wall-clock time at different offsets
    match LogOp::from_u8(rec.op) {
        Some(LogOp::LOP_BEGIN_XACT) if buf.len() >= 0x30 => {
            rec.begin_time = xact_time(raw::read_i32(&buf[0x2C..]), raw::read_i32(&buf[0x28..]));
        }
        Some(LogOp::LOP_COMMIT_XACT) if buf.len() >= 0x20 => {
            rec.end_time = xact_time(raw::read_i32(&buf[0x1C..]), raw::read_i32(&buf[0x18..]));
        }
        _ => {}
    }

    if rec.is_dml() {
        if buf.len() < 0x40 {
            return Err(Error::new(ErrorKind::UnexpectedEof, "short DML log record"));
        }

        rec.page_id = (raw::read_u32(&buf[0x18..]), raw::read_u16(&buf[0x1C..]));
        rec.slot_id = raw::read_u16(&buf[0x1E..]);
        rec.partition_id = raw::read_u64(&buf[0x30..]);
        rec.offset_in_row = raw::read_u16(&buf[0x38..]);
        rec.num_elements = buf[0x3E];

        let n = rec.num_elements as usize;
        if 0x40 + 2 * n > buf.len() {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "row log content lengths past record end",
            ));
        }

        let lengths: Vec<usize> = (0..n)
            .map(|i| raw::read_u16(&buf[0x40 + 2 * i..]) as usize)
            .collect();

        let mut content_offset = raw::align4(2 * n);
        for len in lengths {
            let start = 0x40 + content_offset;
            let end = start + len;
            if end > buf.len() {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "row log content past record end",
                ));
            }

            rec.row_log_content.push(buf[start..end].to_vec());
            if len != 0 {
                content_offset += raw::align4(len);
            }
        }
    }

    Ok(rec)
}

/// Total record length from the header alone: fixed part, the padded length
/// array, and every nonzero fragment padded to a 4-byte multiple.
pub fn calc_record_len(buf: &[u8]) -> Result<usize> {
    if buf.len() < 0x40 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "short log record"));
    }

    let fixed_length = raw::read_u16(&buf[0x02..]) as usize;
    let n = buf[0x3E] as usize;
    if 0x40 + 2 * n > buf.len() {
        return Err(Error::new(ErrorKind::UnexpectedEof, "short log record"));
    }

    let mut total = fixed_length + 2 + raw::align4(2 * n);
    for i in 0..n {
        total += raw::align4(raw::read_u16(&buf[0x40 + 2 * i..]) as usize);
    }

    Ok(total)
}

/// Undo the block protection inside a segment: the true first byte of every
/// 512-byte block was relocated to the block's last byte when the segment
/// was written. Works on a copy; a trailing partial block is left as-is.
pub fn fixup(seg: &[u8]) -> Vec<u8> {
    let mut out = seg.to_vec();

    let mut offset = 0;
    while offset + BLOCK_SIZE <= out.len() {
        out[offset] = out[offset + BLOCK_SIZE - 1];
        offset += BLOCK_SIZE;
    }

    out
}

/// Header of a log segment (the block group hosting a slot array of
/// records), read after fixup.
#[derive(Debug, Clone, Default)]
pub struct SegmentHeader {
    pub slot_num: u16,
    pub seg_size: usize,
    pub first_lsn: Lsn,
    pub timestamp: Option<NaiveDateTime>,
}

/// Parse a log segment: apply fixup, read the header, walk the slot array
/// and decode every record. Records that fail to parse are dropped.
pub fn parse_segment(
    seg: &[u8],
    vlf_seqnum: u32,
    block_num: usize,
) -> Result<(SegmentHeader, Vec<LogRecord>)> {
    if seg.len() < 0x40 {
        return Err(Error::new(ErrorKind::UnexpectedEof, "short log segment"));
    }

    let fixed = fixup(seg);

    let header = SegmentHeader {
        slot_num: raw::read_u16(&fixed[0x02..]),
        seg_size: raw::read_u16(&fixed[0x04..]) as usize,
        first_lsn: Lsn::read(&fixed[0x0C..]),
        timestamp: xact_time(raw::read_i32(&fixed[0x34..]), raw::read_i32(&fixed[0x30..])),
    };

    if header.seg_size > fixed.len() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "segment size past segment end",
        ));
    }

    let offsets = page::slot_array(&fixed[..header.seg_size], header.slot_num);
    let tail = header.seg_size - offsets.len() * 2;

    let mut records = Vec::new();
    for (i, &offset) in offsets.iter().enumerate() {
        let offset = offset as usize;
        let end = offsets
            .get(i + 1)
            .map(|&next| next as usize)
            .unwrap_or(tail);
        if offset >= fixed.len() || end <= offset {
            continue;
        }

        match parse_record(&fixed[offset..]) {
            Ok(mut rec) => {
                rec.vlf_seqnum = vlf_seqnum;
                rec.block_num = block_num;
                rec.slot_num = i + 1;
                rec.offset = offset;
                rec.length = end - offset;
                records.push(rec);
            }
            Err(err) => debug!(vlf_seqnum, block_num, offset, "skipped log record: {err}"),
        }
    }

    Ok((header, records))
}

/// Decode every segment of every VLF, in ascending VLF-offset order.
pub fn parse_vlfs(ldf: &FileBuf, vlfs: &[VlfInfo]) -> Vec<LogRecord> {
    let mut records = Vec::new();

    for vlf in vlfs {
        let Ok(buf) = ldf.block(vlf.offset, vlf.size) else {
            continue;
        };

        for (i, &offset) in vlf.segments.iter().enumerate() {
            let end = vlf.segments.get(i + 1).copied().unwrap_or(vlf.size);
            let block_num = offset / BLOCK_SIZE;

            match parse_segment(&buf[offset..end], vlf.seqnum, block_num) {
                Ok((header, mut recs)) => {
                    debug!(
                        seqnum = vlf.seqnum,
                        block_num,
                        slots = header.slot_num,
                        first_lsn = %header.first_lsn,
                        "parsed segment"
                    );
                    records.append(&mut recs);
                }
                Err(err) => debug!(seqnum = vlf.seqnum, block_num, "skipped segment: {err}"),
            }
        }
    }

    records
}
