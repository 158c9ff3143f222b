//! Shared writable mappings of the lock file.
//!
//! Each participant holds two independent mappings: a fixed-size mapping of
//! the `SharedInfo` prefix, created once and never moved (the embedded
//! mutexes and condvars must not relocate while locked), and a growable
//! mapping covering the version ring, recreated at a larger size whenever
//! ring growth is detected.

use std::fs::File;

use loam_error::Result;
use memmap2::{MmapOptions, MmapRaw};

/// A shared, writable mapping of the first `len` bytes of a file.
pub(crate) struct FileMap {
    map: MmapRaw,
}

impl FileMap {
    /// Map the first `len` bytes of `file`. The file must be at least that
    /// long.
    pub fn map(file: &File, len: usize) -> Result<Self> {
        let map = MmapOptions::new().len(len).map_raw(file)?;
        Ok(Self { map })
    }

    /// Replace this mapping with a fresh one of `len` bytes.
    ///
    /// Remapping is idempotent: the backing file already grew under the
    /// write mutex before any index requiring the larger size could have
    /// been published, so concurrent remaps by other participants are safe.
    pub fn remap(&mut self, file: &File, len: usize) -> Result<()> {
        *self = Self::map(file, len)?;
        Ok(())
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

/// Grow `file` to at least `len` bytes. Never shrinks.
pub(crate) fn prealloc(file: &File, len: u64) -> Result<()> {
    if file.metadata()?.len() < len {
        file.set_len(len)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_map_and_remap_sees_growth() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mapped.bin");
        let mut file = File::create(&path).expect("create");
        file.write_all(&[0xAB; 64]).expect("write");
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .expect("reopen");

        let mut map = FileMap::map(&file, 64).expect("map");
        assert_eq!(unsafe { *map.as_ptr() }, 0xAB);
        assert_eq!(unsafe { *map.as_ptr().add(63) }, 0xAB);

        prealloc(&file, 128).expect("prealloc");
        map.remap(&file, 128).expect("remap");
        // The original bytes survive the remap; the extension reads back
        // as zeros.
        assert_eq!(unsafe { *map.as_ptr() }, 0xAB);
        assert_eq!(unsafe { *map.as_ptr().add(100) }, 0);
    }

    #[test]
    fn test_prealloc_never_shrinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grow.bin");
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .expect("open");
        file.set_len(256).expect("set_len");

        prealloc(&file, 64).expect("prealloc smaller");
        assert_eq!(file.metadata().expect("meta").len(), 256);

        prealloc(&file, 512).expect("prealloc larger");
        assert_eq!(file.metadata().expect("meta").len(), 512);
    }

    #[test]
    fn test_shared_mapping_is_write_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shared.bin");
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .expect("open");
        file.set_len(8).expect("set_len");

        let a = FileMap::map(&file, 8).expect("map a");
        let b = FileMap::map(&file, 8).expect("map b");
        unsafe {
            *a.as_ptr() = 0x5A;
        }
        assert_eq!(unsafe { *b.as_ptr() }, 0x5A);
    }
}
