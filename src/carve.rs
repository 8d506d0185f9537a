use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::filebuf::FileBuf;
use crate::logrec::{self, LogRecord};

/// Carving reads the LDF in chunks of one cluster.
pub const CARVE_CHUNK: usize = 4096;

/// Offset of the op byte inside a log record.
const OP_OFFSET: usize = 0x16;

/// Flag-bit prefixes a DML/BEGIN/COMMIT record prologue can start with.
const SIG_PREFIXES: [[u8; 2]; 5] = [
    [0x00, 0x00],
    [0x40, 0x00],
    [0x48, 0x00],
    [0x80, 0x00],
    [0x88, 0x00],
];

/// Fixed-length markers at record offset 2 paired with the op bytes they
/// announce: 0x3E = DML (INSERT/DELETE/MODIFY), 0x4C = BEGIN_XACT,
/// 0x50 = COMMIT_XACT.
const SIG_DML: [u8; 2] = [0x3E, 0x00];
const SIG_BEGIN: [u8; 2] = [0x4C, 0x00];
const SIG_COMMIT: [u8; 2] = [0x50, 0x00];

fn matches_signature(window: &[u8]) -> bool {
    let prefix = [window[0], window[1]];
    if !SIG_PREFIXES.contains(&prefix) {
        return false;
    }

    let marker = [window[2], window[3]];
    let op = window[OP_OFFSET];

    (marker == SIG_DML && matches!(op, 2..=4))
        || (marker == SIG_BEGIN && op == 128)
        || (marker == SIG_COMMIT && op == 129)
}

/// Scan one buffer for record prologues at 4-byte-aligned offsets, yielding
/// `(offset, transaction id)` per hit.
pub fn scan_sig(buf: &[u8]) -> Vec<(usize, [u8; 6])> {
    let mut hits = Vec::new();

    let mut offset = 0;
    while offset + OP_OFFSET < buf.len() {
        if matches_signature(&buf[offset..]) {
            let mut transaction_id = [0u8; 6];
            transaction_id.copy_from_slice(&buf[offset + 0x10..offset + 0x16]);
            hits.push((offset, transaction_id));
        }
        offset += 4;
    }

    hits
}

/// Scan the whole LDF with `jobs` workers over disjoint chunk ranges and
/// merge the hits into one offset-ordered map.
pub fn scan_file(ldf: &FileBuf, jobs: usize) -> BTreeMap<usize, [u8; 6]> {
    info!(jobs, "carving signature scan");

    let num_chunks = ldf.len() / CARVE_CHUNK;
    let jobs = jobs.max(1);
    let per_worker = num_chunks / jobs;

    let mut hits = BTreeMap::new();

    std::thread::scope(|scope| {
        let mut workers = Vec::with_capacity(jobs);

        for i in 0..jobs {
            let start = i * per_worker * CARVE_CHUNK;
            let end = if i == jobs - 1 {
                ldf.len()
            } else {
                (i + 1) * per_worker * CARVE_CHUNK
            };

            workers.push(scope.spawn(move || {
                let mut found = Vec::new();

                let mut offset = start;
                while offset < end {
                    if let Ok(chunk) = ldf.block_upto(offset, CARVE_CHUNK) {
                        for (hit, transaction_id) in scan_sig(chunk) {
                            found.push((offset + hit, transaction_id));
                        }
                    }
                    offset += CARVE_CHUNK;
                }

                found
            }));
        }

        for worker in workers {
            // ranges are disjoint: the merge cannot see duplicate offsets
            hits.extend(worker.join().expect("carving worker panicked"));
        }
    });

    info!(hits = hits.len(), "carving scan complete");
    hits
}

/// Re-read every hit at its exact record length and parse it.
pub fn process_hits(ldf: &FileBuf, hits: &BTreeMap<usize, [u8; 6]>) -> Vec<LogRecord> {
    let mut records = Vec::new();

    for &offset in hits.keys() {
        let Ok(probe) = ldf.block_upto(offset, CARVE_CHUNK) else {
            continue;
        };
        let Ok(record_len) = logrec::calc_record_len(probe) else {
            continue;
        };
        let Ok(buf) = ldf.block(offset, record_len) else {
            debug!(offset, record_len, "carved record extends past end of file");
            continue;
        };

        match logrec::parse_record(buf) {
            Ok(mut rec) => {
                rec.offset = offset;
                rec.length = record_len;
                records.push(rec);
            }
            Err(err) => debug!(offset, "skipped carved record: {err}"),
        }
    }

    info!(records = records.len(), "carved records parsed");
    records
}

#[cfg(test)]
mod test {
    use super::*;

    fn plant(buf: &mut [u8], offset: usize, marker: [u8; 2], op: u8, transaction_id: [u8; 6]) {
        buf[offset..offset + 2].copy_from_slice(&[0x00, 0x00]);
        buf[offset + 2..offset + 4].copy_from_slice(&marker);
        buf[offset + 0x10..offset + 0x16].copy_from_slice(&transaction_id);
        buf[offset + OP_OFFSET] = op;
    }

    #[test]
    fn test_scan_sig_finds_aligned_signature() {
        let mut buf = vec![0xFFu8; 4096];
        plant(&mut buf, 256, SIG_DML, 2, [1, 2, 3, 4, 5, 6]);

        let hits = scan_sig(&buf);
        assert_eq!(hits, vec![(256, [1, 2, 3, 4, 5, 6])]);
    }

    #[test]
    fn test_scan_sig_ignores_unaligned_signature() {
        let mut buf = vec![0xFFu8; 4096];
        plant(&mut buf, 258, SIG_DML, 2, [1, 2, 3, 4, 5, 6]);

        assert!(scan_sig(&buf).is_empty());
    }

    #[test]
    fn test_scan_sig_checks_op_byte() {
        let mut buf = vec![0xFFu8; 4096];
        plant(&mut buf, 0, SIG_DML, 7, [0; 6]); // not a DML op
        plant(&mut buf, 64, SIG_BEGIN, 128, [9; 6]);
        plant(&mut buf, 128, SIG_COMMIT, 129, [8; 6]);
        plant(&mut buf, 192, SIG_BEGIN, 129, [7; 6]); // marker/op mismatch

        let hits = scan_sig(&buf);
        assert_eq!(hits, vec![(64, [9; 6]), (128, [8; 6])]);
    }
}
