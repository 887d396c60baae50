//! Read-only model file mapping.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::Result;

/// A memory-mapped model file. Weight loading slices directly out of
/// the map; nothing is copied until a shard is extracted.
pub struct ModelFile {
    mmap: Mmap,
}

impl ModelFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(ModelFile { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// The tensor stream: everything past the header block.
    pub fn tensor_data(&self, header_size: usize) -> &[u8] {
        &self.mmap[header_size..]
    }
}
