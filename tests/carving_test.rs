use std::io::Write;

use mssqlutil::carve;
use mssqlutil::filebuf::FileBuf;
use mssqlutil::logrec::{self, LogOp};
use mssqlutil::vlf;

/// A minimal DML log record: zeroed flag bits, fixed length 0x3E, the op
/// byte at 0x16 and padded row-log-content fragments from 0x40.
fn dml_record(op: u8, transaction_id: [u8; 6], fragments: &[&[u8]]) -> Vec<u8> {
    let mut buf = vec![0u8; 0x40];
    buf[0x02..0x04].copy_from_slice(&0x3Eu16.to_le_bytes());
    buf[0x10..0x16].copy_from_slice(&transaction_id);
    buf[0x16] = op;
    buf[0x3E] = fragments.len() as u8;

    let aligned = |n: usize| (n + 3) & !3;
    for frag in fragments {
        buf.extend_from_slice(&(frag.len() as u16).to_le_bytes());
    }
    buf.resize(0x40 + aligned(2 * fragments.len()), 0);
    for frag in fragments {
        buf.extend_from_slice(frag);
        buf.resize(aligned(buf.len()), 0);
    }

    buf
}

fn write_temp(image: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(image).expect("write image");
    file.flush().expect("flush image");
    file
}

#[test]
fn carving_finds_planted_records() {
    let mut image = vec![0u8; 1024 * 1024];
    let offsets = [4096usize, 12288, 20480];

    for (i, &offset) in offsets.iter().enumerate() {
        let record = dml_record(2, [i as u8 + 1; 6], &[b"row-image"]);
        image[offset..offset + record.len()].copy_from_slice(&record);
    }

    let file = write_temp(&image);
    let ldf = FileBuf::open(file.path()).expect("open LDF");

    let hits = carve::scan_file(&ldf, 4);
    assert_eq!(hits.keys().copied().collect::<Vec<_>>(), offsets);
    assert_eq!(hits[&4096], [1; 6]);
    assert_eq!(hits[&20480], [3; 6]);

    let records = carve::process_hits(&ldf, &hits);
    assert_eq!(records.len(), 3);
    for (record, &offset) in records.iter().zip(&offsets) {
        assert_eq!(record.op, LogOp::LOP_INSERT_ROWS as u8);
        assert_eq!(record.offset, offset);
        assert_eq!(record.row_log_content[0], b"row-image");
    }
}

#[test]
fn carving_single_worker_covers_the_file() {
    let mut image = vec![0u8; 64 * 1024];
    let record = dml_record(3, [7; 6], &[b"gone"]);
    let offset = image.len() - 8192;
    image[offset..offset + record.len()].copy_from_slice(&record);

    let file = write_temp(&image);
    let ldf = FileBuf::open(file.path()).expect("open LDF");

    let hits = carve::scan_file(&ldf, 1);
    assert_eq!(hits.keys().copied().collect::<Vec<_>>(), vec![offset]);
}

#[test]
fn structured_walk_parses_a_planted_segment() {
    // 8 KiB file header, then one VLF of 16 KiB with a single one-block
    // segment at block 2
    let vlf_size = 16 * 1024u32;
    let mut image = vec![0u8; vlf::LDF_HEADER_SIZE + vlf_size as usize];

    let vlf_offset = vlf::LDF_HEADER_SIZE;
    image[vlf_offset + 0x04..vlf_offset + 0x08].copy_from_slice(&5u32.to_le_bytes());
    image[vlf_offset + 0x10..vlf_offset + 0x14].copy_from_slice(&vlf_size.to_le_bytes());

    let seg_offset = vlf_offset + 1024;
    let record = dml_record(2, [9; 6], &[b"abcd"]);

    image[seg_offset] = 0x50; // segment marker; fixup restores the true byte
    image[seg_offset + 0x02..seg_offset + 0x04].copy_from_slice(&1u16.to_le_bytes());
    image[seg_offset + 0x04..seg_offset + 0x06].copy_from_slice(&512u16.to_le_bytes());
    image[seg_offset + 0x40..seg_offset + 0x40 + record.len()].copy_from_slice(&record);
    // slot array: one entry in the last two bytes of the segment
    image[seg_offset + 510..seg_offset + 512].copy_from_slice(&0x40u16.to_le_bytes());

    let file = write_temp(&image);
    let ldf = FileBuf::open(file.path()).expect("open LDF");

    let mut vlfs = vlf::scan_vlfs(&ldf);
    assert_eq!(vlfs.len(), 1);
    assert_eq!(vlfs[0].seqnum, 5);
    assert_eq!(vlfs[0].offset, vlf::LDF_HEADER_SIZE);

    vlf::scan_segments(&ldf, &mut vlfs);
    assert_eq!(vlfs[0].segments, vec![1024]);

    let records = logrec::parse_vlfs(&ldf, &vlfs);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op, LogOp::LOP_INSERT_ROWS as u8);
    assert_eq!(records[0].vlf_seqnum, 5);
    assert_eq!(records[0].block_num, 2);
    assert_eq!(records[0].transaction_id, [9; 6]);
    assert_eq!(records[0].row_log_content[0], b"abcd");
}
