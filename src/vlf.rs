use tracing::{debug, info};

use crate::BLOCK_SIZE;
use crate::filebuf::FileBuf;
use crate::raw;

/// The LDF starts with an 8 KiB file header; the first VLF follows it.
pub const LDF_HEADER_SIZE: usize = 8192;

/// Size of the header at the start of every VLF.
pub const VLF_HEADER_SIZE: usize = 0x30;

/// First-byte markers of a block that starts a log segment.
pub const SEGMENT_MARKERS: [u8; 2] = [0x50, 0x58];

/// One Virtual Log File inside the LDF.
#[derive(Debug, Clone, Default)]
pub struct VlfInfo {
    pub seqnum: u32,
    pub size: usize,
    pub offset: usize,
    /// Block-aligned segment start offsets relative to the VLF.
    pub segments: Vec<usize>,
}

/// Enumerate VLFs by walking their headers from the end of the file header.
/// A zero sequence number marks an unused VLF, which is skipped but still
/// advanced over; a short or zero-sized header ends the walk.
pub fn scan_vlfs(ldf: &FileBuf) -> Vec<VlfInfo> {
    info!("LDF VLF scan");

    let mut vlfs = Vec::new();
    let mut offset = LDF_HEADER_SIZE;

    while let Ok(buf) = ldf.block(offset, VLF_HEADER_SIZE) {
        let seqnum = raw::read_u32(&buf[0x04..]);
        let size = raw::read_u32(&buf[0x10..]) as usize;

        if size == 0 {
            break;
        }

        if seqnum != 0 {
            vlfs.push(VlfInfo {
                seqnum,
                size,
                offset,
                segments: Vec::new(),
            });
        }

        offset += size;
    }

    // record order already follows ascending file offset; keep it explicit
    vlfs.sort_by_key(|v| v.offset);

    info!(vlfs = vlfs.len(), "VLF scan complete");
    vlfs
}

/// Mark the block-aligned segment starts inside each VLF.
pub fn scan_segments(ldf: &FileBuf, vlfs: &mut [VlfInfo]) {
    info!("log segment scan");

    for vlf in vlfs.iter_mut() {
        let Ok(buf) = ldf.block(vlf.offset, vlf.size) else {
            debug!(seqnum = vlf.seqnum, "VLF extends past end of file, skipped");
            continue;
        };

        let mut offset = 0;
        while offset < vlf.size {
            if SEGMENT_MARKERS.contains(&buf[offset]) {
                vlf.segments.push(offset);
            }
            offset += BLOCK_SIZE;
        }
    }
}
