use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use anyhow::Context;
use mmap_rs::{Mmap, MmapFlags, MmapOptions};

/// Read-only view over an MDF or LDF file.
///
/// Both files are opened once and read arbitrarily often; all accesses go
/// through bounds-checked [`FileBuf::block`] slices of the mapping.
pub struct FileBuf {
    m: Mmap,
}

impl FileBuf {
    pub fn open(file_path: &Path) -> anyhow::Result<FileBuf> {
        let file = std::fs::File::open(file_path)
            .with_context(|| format!("open {}", file_path.display()))?;
        let meta = file.metadata().context("get file metadata")?;
        let size = meta.len();

        if size == 0 {
            return Err(anyhow::anyhow!("{} is empty", file_path.display()));
        }

        let mmap = unsafe {
            MmapOptions::new(size as usize)
                .context("mmap option")?
                .with_file(&file, 0u64)
                .with_flags(MmapFlags::SHARED)
                .map()
                .with_context(|| format!("mmap {}", file_path.display()))?
        };

        Ok(FileBuf { m: mmap })
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ensure(&self, pos: usize, len: usize) -> Result<()> {
        match pos.checked_add(len) {
            Some(end) if end <= self.m.len() => Ok(()),
            _ => Err(Error::from(ErrorKind::UnexpectedEof)),
        }
    }

    pub fn block(&self, pos: usize, len: usize) -> Result<&[u8]> {
        self.ensure(pos, len)?;

        Ok(&self.m.as_slice()[pos..pos + len])
    }

    /// Like [`FileBuf::block`], but truncated at end of file instead of
    /// failing. Mirrors a short read near EOF.
    pub fn block_upto(&self, pos: usize, len: usize) -> Result<&[u8]> {
        if pos >= self.m.len() {
            return Err(Error::from(ErrorKind::UnexpectedEof));
        }

        let end = usize::min(pos + len, self.m.len());
        Ok(&self.m.as_slice()[pos..end])
    }
}

impl std::ops::Deref for FileBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.m.as_slice()
    }
}
