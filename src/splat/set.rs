//! Splat files and ordered collections of them
//!
//! Input parsing (PLY and friends) happens upstream; a [`SplatFile`] exposes the
//! decoded splats of one file through positioned reads. Splat IDs carry the
//! file index in their high bits so a single `u64` names any splat in a set.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytemuck::Zeroable;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::splat::Splat;

/// Number of low bits of a splat ID holding the in-file index.
pub const SCAN_ID_SHIFT: u32 = 40;

/// Mask extracting the in-file index from a splat ID.
pub const SPLAT_ID_MASK: u64 = (1 << SCAN_ID_SHIFT) - 1;

/// Reads used internally when streaming a whole set.
const STREAM_CHUNK: usize = 8192;

/// Compose a splat ID from a file index and an in-file splat index.
pub fn make_splat_id(file: u32, index: u64) -> u64 {
    debug_assert!(index <= SPLAT_ID_MASK);
    ((file as u64) << SCAN_ID_SHIFT) | index
}

/// Split a splat ID into its file index and in-file splat index.
pub fn split_splat_id(id: u64) -> (u32, u64) {
    ((id >> SCAN_ID_SHIFT) as u32, id & SPLAT_ID_MASK)
}

/// One input file of decoded splats.
pub trait SplatFile: Send + Sync {
    /// Number of splats in the file (including non-finite ones).
    fn len(&self) -> u64;

    /// Read `out.len()` splats starting at `start`. The range must lie within
    /// the file.
    fn read(&self, start: u64, out: &mut [Splat]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory splat file, used by tests and small runs.
pub struct VecSplatFile {
    splats: Vec<Splat>,
}

impl VecSplatFile {
    pub fn new(splats: Vec<Splat>) -> Self {
        Self { splats }
    }
}

impl SplatFile for VecSplatFile {
    fn len(&self) -> u64 {
        self.splats.len() as u64
    }

    fn read(&self, start: u64, out: &mut [Splat]) -> Result<()> {
        let start = start as usize;
        let end = start
            .checked_add(out.len())
            .filter(|&e| e <= self.splats.len())
            .ok_or(Error::State("splat read past end of file"))?;
        out.copy_from_slice(&self.splats[start..end]);
        Ok(())
    }
}

/// A flat binary file of little-endian splat records (seven `f32` each).
pub struct BinSplatFile {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
}

impl BinSplatFile {
    const RECORD: u64 = std::mem::size_of::<Splat>() as u64;

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let bytes = file
            .metadata()
            .map_err(|e| Error::io(path, e))?
            .len();
        if bytes % Self::RECORD != 0 {
            return Err(Error::Format(format!(
                "{}: size {} is not a whole number of splat records",
                path.display(),
                bytes
            )));
        }
        Ok(Self {
            path: path.to_owned(),
            file: Mutex::new(file),
            len: bytes / Self::RECORD,
        })
    }
}

impl SplatFile for BinSplatFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&self, start: u64, out: &mut [Splat]) -> Result<()> {
        if start + out.len() as u64 > self.len {
            return Err(Error::State("splat read past end of file"));
        }
        let mut file = self.file.lock().expect("splat file lock poisoned");
        file.seek(SeekFrom::Start(start * Self::RECORD))
            .map_err(|e| Error::io(&self.path, e))?;
        file.read_exact(bytemuck::cast_slice_mut(out))
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }
}

/// An ordered collection of splat files.
///
/// Streams skip non-finite splats; the number skipped is accumulated on the
/// set and reported separately from the stream's own counts.
#[derive(Default)]
pub struct FileSet {
    files: Vec<Box<dyn SplatFile>>,
    non_finite: AtomicU64,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a file, returning its file index.
    pub fn add_file(&mut self, file: Box<dyn SplatFile>) -> Result<u32> {
        if self.files.len() as u64 >= 1 << (64 - SCAN_ID_SHIFT) {
            return Err(Error::Resource("too many input files".into()));
        }
        if file.len() > SPLAT_ID_MASK {
            return Err(Error::Resource("too many splats in one file".into()));
        }
        self.files.push(file);
        Ok((self.files.len() - 1) as u32)
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, id: u32) -> &dyn SplatFile {
        self.files[id as usize].as_ref()
    }

    /// Total splat count over all files, including non-finite splats.
    pub fn total_splats(&self) -> u64 {
        self.files.iter().map(|f| f.len()).sum()
    }

    /// Number of non-finite splats skipped by streams so far.
    pub fn non_finite_count(&self) -> u64 {
        self.non_finite.load(Ordering::Relaxed)
    }

    /// Read a contiguous run of splats named by a starting splat ID.
    ///
    /// No finiteness filtering is applied; callers pass ranges that are known
    /// to contain only finite splats.
    pub fn read_range(&self, first_id: u64, out: &mut [Splat]) -> Result<()> {
        let (file, index) = split_splat_id(first_id);
        self.file(file).read(index, out)
    }

    /// Stream every splat in the set in ID order.
    pub fn stream(&self) -> FileSetStream<'_> {
        FileSetStream {
            set: self,
            file: 0,
            index: 0,
            scratch: Vec::new(),
        }
    }
}

/// Streaming cursor over a [`FileSet`].
pub struct FileSetStream<'a> {
    set: &'a FileSet,
    file: usize,
    index: u64,
    scratch: Vec<Splat>,
}

impl FileSetStream<'_> {
    /// Fill `out` (and the matching `ids`) with the next finite splats.
    ///
    /// Returns the number written; a short count signals end of stream.
    pub fn read(&mut self, out: &mut [Splat], ids: &mut [u64]) -> Result<usize> {
        assert_eq!(out.len(), ids.len());
        let mut written = 0;
        while written < out.len() && self.file < self.set.files.len() {
            let file = self.set.file(self.file as u32);
            if self.index >= file.len() {
                self.file += 1;
                self.index = 0;
                continue;
            }
            let want = (out.len() - written)
                .min((file.len() - self.index) as usize)
                .min(STREAM_CHUNK);
            self.scratch.resize(want, Splat::zeroed());
            file.read(self.index, &mut self.scratch)?;
            let mut skipped = 0;
            for (j, splat) in self.scratch.iter().enumerate() {
                if splat.is_finite() {
                    out[written] = *splat;
                    ids[written] = make_splat_id(self.file as u32, self.index + j as u64);
                    written += 1;
                } else {
                    skipped += 1;
                }
            }
            if skipped > 0 {
                self.set.non_finite.fetch_add(skipped, Ordering::Relaxed);
            }
            self.index += want as u64;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    fn splat(x: f32) -> Splat {
        Splat::new(Vec3::new(x, 0.0, 0.0), Vec3::Z, 0.5)
    }

    #[test]
    fn test_splat_id_roundtrip() {
        let id = make_splat_id(3, 12345);
        assert_eq!(split_splat_id(id), (3, 12345));
        assert!(make_splat_id(1, 0) > make_splat_id(0, SPLAT_ID_MASK) - 1);
    }

    #[test]
    fn test_stream_spans_files() {
        let mut set = FileSet::new();
        set.add_file(Box::new(VecSplatFile::new(vec![splat(0.0), splat(1.0)])))
            .unwrap();
        set.add_file(Box::new(VecSplatFile::new(vec![splat(2.0)])))
            .unwrap();

        let mut stream = set.stream();
        let mut out = vec![Splat::zeroed(); 8];
        let mut ids = vec![0u64; 8];
        let n = stream.read(&mut out, &mut ids).unwrap();
        assert_eq!(n, 3);
        assert_eq!(ids[0], make_splat_id(0, 0));
        assert_eq!(ids[1], make_splat_id(0, 1));
        assert_eq!(ids[2], make_splat_id(1, 0));
        assert_eq!(out[2].position[0], 2.0);
        // EOF afterwards
        assert_eq!(stream.read(&mut out, &mut ids).unwrap(), 0);
    }

    #[test]
    fn test_stream_skips_non_finite() {
        let mut bad = splat(1.0);
        bad.position[0] = f32::NAN;
        let mut set = FileSet::new();
        set.add_file(Box::new(VecSplatFile::new(vec![splat(0.0), bad, splat(2.0)])))
            .unwrap();

        let mut stream = set.stream();
        let mut out = vec![Splat::zeroed(); 8];
        let mut ids = vec![0u64; 8];
        let n = stream.read(&mut out, &mut ids).unwrap();
        assert_eq!(n, 2);
        assert_eq!(ids[1], make_splat_id(0, 2));
        assert_eq!(set.non_finite_count(), 1);
    }

    #[test]
    fn test_bin_splat_file_roundtrip() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let splats = [splat(1.0), splat(2.0), splat(3.0)];
        tmp.write_all(bytemuck::cast_slice(&splats)).unwrap();
        tmp.flush().unwrap();

        let file = BinSplatFile::open(tmp.path()).unwrap();
        assert_eq!(file.len(), 3);
        let mut out = [Splat::zeroed(); 2];
        file.read(1, &mut out).unwrap();
        assert_eq!(out[0], splat(2.0));
        assert_eq!(out[1], splat(3.0));
    }

    #[test]
    fn test_bin_splat_file_bad_size() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 13]).unwrap();
        tmp.flush().unwrap();
        assert!(matches!(
            BinSplatFile::open(tmp.path()),
            Err(Error::Format(_))
        ));
    }
}
