//! Differentially-coded splat-to-bucket index
//!
//! One streaming pass over the input computes, for each splat, the box of
//! buckets its influence region touches. Runs of consecutive splats with an
//! identical box coalesce into a *blob*; blobs are spilled to temporary files
//! and replayed by later passes instead of re-scanning billions of splats.
//!
//! Wire format, little-endian. A record is either *full* (ten `u32` words:
//! `first_splat` hi/lo, `last_splat` hi/lo, then lower/upper per axis) or
//! *differential* (one `u32` with bit 31 set):
//!
//! ```text
//! bits  0..2, 4..6, 8..10   signed delta of lower per axis vs previous upper
//! bits  3, 7, 11            upper - lower per axis (0 or 1)
//! bits 12..30               splat count (last_splat - first_splat)
//! bit  31                   tag: 1 = differential
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytemuck::Zeroable;
use rayon::prelude::*;
use tempfile::NamedTempFile;

use crate::core::error::Error;
use crate::core::progress::ProgressMeter;
use crate::core::stats::Registry;
use crate::core::types::{Result, Vec3};
use crate::math::{div_down, Grid};
use crate::splat::set::{FileSet, FileSetStream};
use crate::splat::Splat;

/// Splats consumed per streaming iteration during the index build.
const BUILD_BUFFER: usize = 64 * 1024;

/// Slices smaller than this are not worth a full record at their head, so the
/// build never splits a buffer finer than this.
const MIN_SLICE: usize = 4096;

/// Tag bit distinguishing differential records from full ones.
const DIFF_TAG: u32 = 0x8000_0000;

/// Differential records hold the splat count in 19 bits.
const MAX_DIFF_COUNT: u64 = 1 << 19;

/// A run of consecutive splats sharing one bucket coverage box.
///
/// `last_splat` is exclusive; `lower`/`upper` are inclusive bucket coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobInfo {
    pub first_splat: u64,
    pub last_splat: u64,
    pub lower: [i32; 3],
    pub upper: [i32; 3],
}

fn extract_unsigned(value: u32, lbit: u32, hbit: u32) -> u32 {
    debug_assert!(lbit < hbit && hbit <= 32 && hbit - lbit < 32);
    (value >> lbit) & ((1u32 << (hbit - lbit)) - 1)
}

fn extract_signed(value: u32, lbit: u32, hbit: u32) -> i32 {
    let bits = hbit - lbit;
    let raw = extract_unsigned(value, lbit, hbit) as i32;
    if raw & (1 << (bits - 1)) != 0 {
        raw - (1 << bits)
    } else {
        raw
    }
}

fn insert_unsigned(payload: u32, value: u32, lbit: u32, hbit: u32) -> u32 {
    debug_assert!(lbit < hbit && hbit <= 32 && hbit - lbit < 32);
    debug_assert!(value < 1 << (hbit - lbit));
    payload | (value << lbit)
}

fn insert_signed(payload: u32, value: i32, lbit: u32, hbit: u32) -> u32 {
    let bits = hbit - lbit;
    debug_assert!(value >= -(1 << (bits - 1)) && value < (1 << (bits - 1)));
    let raw = if value < 0 { value + (1 << bits) } else { value } as u32;
    payload | (raw << lbit)
}

/// Append the wire encoding of `cur` to `words`.
///
/// A differential record is legal iff a previous record exists in the same
/// stream, the box is at most two buckets wide per axis, the lower corner is
/// within the representable delta of the previous upper corner, the splat
/// count fits in 19 bits, and the blob is contiguous in splat ID with its
/// predecessor. Anything else gets a full record.
fn encode_blob(words: &mut Vec<u32>, prev: Option<&BlobInfo>, cur: &BlobInfo) {
    if let Some(prev) = prev {
        let legal = prev.last_splat == cur.first_splat
            && cur.last_splat - cur.first_splat < MAX_DIFF_COUNT
            && (0..3).all(|i| {
                cur.upper[i] - cur.lower[i] <= 1
                    && cur.lower[i] >= prev.upper[i] - 4
                    && cur.lower[i] <= prev.upper[i] + 3
            });
        if legal {
            let mut payload = DIFF_TAG;
            for i in 0..3 {
                let lbit = 4 * i as u32;
                payload = insert_signed(payload, cur.lower[i] - prev.upper[i], lbit, lbit + 3);
                payload = insert_unsigned(
                    payload,
                    (cur.upper[i] - cur.lower[i]) as u32,
                    lbit + 3,
                    lbit + 4,
                );
            }
            payload =
                insert_unsigned(payload, (cur.last_splat - cur.first_splat) as u32, 12, 31);
            words.push(payload);
            return;
        }
    }
    words.push((cur.first_splat >> 32) as u32);
    words.push(cur.first_splat as u32);
    words.push((cur.last_splat >> 32) as u32);
    words.push(cur.last_splat as u32);
    for i in 0..3 {
        words.push(cur.lower[i] as u32);
        words.push(cur.upper[i] as u32);
    }
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Decode one record in place. `blob` must hold the previously decoded record
/// (differential records reconstruct from it alone, guided by the tag bit).
fn decode_record(r: &mut impl Read, blob: &mut BlobInfo) -> io::Result<()> {
    let word = read_u32(r)?;
    if word & DIFF_TAG != 0 {
        for i in 0..3 {
            let lbit = 4 * i as u32;
            blob.lower[i] = blob.upper[i] + extract_signed(word, lbit, lbit + 3);
            blob.upper[i] = blob.lower[i] + extract_unsigned(word, lbit + 3, lbit + 4) as i32;
        }
        blob.first_splat = blob.last_splat;
        blob.last_splat = blob.first_splat + extract_unsigned(word, 12, 31) as u64;
    } else {
        let first_lo = read_u32(r)?;
        let last_hi = read_u32(r)?;
        let last_lo = read_u32(r)?;
        blob.first_splat = ((word as u64) << 32) | first_lo as u64;
        blob.last_splat = ((last_hi as u64) << 32) | last_lo as u64;
        for i in 0..3 {
            blob.lower[i] = read_u32(r)? as i32;
            blob.upper[i] = read_u32(r)? as i32;
        }
    }
    Ok(())
}

/// Bucket coverage for a grid based at the origin.
#[derive(Clone, Copy)]
pub struct SplatToBuckets {
    inv_spacing: f32,
    bucket_size: i64,
}

impl SplatToBuckets {
    pub fn new(spacing: f32, bucket_size: u32) -> Self {
        assert!(spacing > 0.0 && bucket_size > 0);
        Self {
            inv_spacing: 1.0 / spacing,
            bucket_size: bucket_size as i64,
        }
    }

    /// Inclusive bucket box covered by the splat's influence region, with
    /// bucket (0,0,0) overlapping cell (0,0,0).
    pub fn buckets(&self, splat: &Splat) -> ([i32; 3], [i32; 3]) {
        let mut lower = [0i32; 3];
        let mut upper = [0i32; 3];
        for i in 0..3 {
            let lo = ((splat.position[i] - splat.radius) * self.inv_spacing).floor() as i64;
            let hi = ((splat.position[i] + splat.radius) * self.inv_spacing).floor() as i64;
            lower[i] = div_down(lo, self.bucket_size) as i32;
            upper[i] = div_down(hi, self.bucket_size) as i32;
        }
        (lower, upper)
    }
}

/// Bucket coverage against an arbitrary grid, relative to its lower corner.
pub fn splat_to_buckets(splat: &Splat, grid: &Grid, bucket_size: u32) -> ([i32; 3], [i32; 3]) {
    assert!(bucket_size > 0);
    let vlo = grid.world_to_vertex(splat.lower());
    let vhi = grid.world_to_vertex(splat.upper());
    let b = bucket_size as i64;
    let mut lower = [0i32; 3];
    let mut upper = [0i32; 3];
    for i in 0..3 {
        lower[i] = div_down(vlo[i].floor() as i64, b) as i32;
        upper[i] = div_down(vhi[i].floor() as i64, b) as i32;
    }
    (lower, upper)
}

#[derive(Clone, Copy)]
struct Bbox {
    min: [f32; 3],
    max: [f32; 3],
}

impl Default for Bbox {
    fn default() -> Self {
        Self {
            min: [f32::INFINITY; 3],
            max: [f32::NEG_INFINITY; 3],
        }
    }
}

impl Bbox {
    fn add_splat(&mut self, splat: &Splat) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(splat.position[i] - splat.radius);
            self.max[i] = self.max[i].max(splat.position[i] + splat.radius);
        }
    }

    fn merge(&mut self, other: &Bbox) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    fn is_empty(&self) -> bool {
        self.min[0] > self.max[0]
    }
}

struct BlobFile {
    file: NamedTempFile,
    n_blobs: u64,
}

struct SlicePart {
    words: Vec<u32>,
    n_blobs: u64,
    bbox: Bbox,
}

/// Build the blob stream for one contiguous slice of a read buffer. The first
/// blob of every slice gets a full record, so the encoding depends only on the
/// slice boundaries, not on thread scheduling.
fn build_slice(splats: &[Splat], ids: &[u64], to_buckets: &SplatToBuckets) -> SlicePart {
    let mut part = SlicePart {
        words: Vec::new(),
        n_blobs: 0,
        bbox: Bbox::default(),
    };
    let mut prev: Option<BlobInfo> = None;
    let mut cur: Option<BlobInfo> = None;
    for (splat, &id) in splats.iter().zip(ids) {
        part.bbox.add_splat(splat);
        let (lower, upper) = to_buckets.buckets(splat);
        match cur {
            Some(ref mut c) if c.lower == lower && c.upper == upper && c.last_splat == id => {
                c.last_splat += 1;
            }
            Some(c) => {
                encode_blob(&mut part.words, prev.as_ref(), &c);
                part.n_blobs += 1;
                prev = Some(c);
                cur = Some(BlobInfo {
                    first_splat: id,
                    last_splat: id + 1,
                    lower,
                    upper,
                });
            }
            None => {
                cur = Some(BlobInfo {
                    first_splat: id,
                    last_splat: id + 1,
                    lower,
                    upper,
                });
            }
        }
    }
    if let Some(c) = cur {
        encode_blob(&mut part.words, prev.as_ref(), &c);
        part.n_blobs += 1;
    }
    part
}

/// A splat set with a precomputed blob index.
///
/// [`compute_blobs`](FastBlobSet::compute_blobs) makes one pass over the
/// input, writing the index to temporary files and deriving the bounding grid.
/// Afterwards [`blob_stream`](FastBlobSet::blob_stream) replays the index when
/// the requested grid is compatible, and falls back to a fresh splat scan when
/// it is not. Blob files are deleted when the set is dropped.
pub struct FastBlobSet {
    base: Arc<FileSet>,
    internal_bucket_size: u32,
    blob_files: Vec<BlobFile>,
    bounding_grid: Option<Grid>,
    n_splats: u64,
}

impl FastBlobSet {
    pub fn new(base: Arc<FileSet>) -> Self {
        Self {
            base,
            internal_bucket_size: 0,
            blob_files: Vec::new(),
            bounding_grid: None,
            n_splats: 0,
        }
    }

    pub fn files(&self) -> &Arc<FileSet> {
        &self.base
    }

    /// Number of finite splats seen by the index build.
    pub fn n_splats(&self) -> u64 {
        self.n_splats
    }

    pub fn internal_bucket_size(&self) -> u32 {
        self.internal_bucket_size
    }

    /// Bounding grid derived during the index build.
    pub fn bounding_grid(&self) -> Result<&Grid> {
        self.bounding_grid
            .as_ref()
            .ok_or(Error::State("blob index has not been computed"))
    }

    /// Stream the input once, building the blob index and the bounding grid.
    ///
    /// The input is consumed in buffers of 64 Ki splats; each buffer is sliced
    /// by thread into contiguous sub-slices whose blob streams are appended in
    /// slice order, so the on-disk sequence follows ascending splat ID.
    pub fn compute_blobs(
        &mut self,
        spacing: f32,
        bucket_size: u32,
        tmp_dir: Option<&Path>,
        progress: Option<&dyn ProgressMeter>,
    ) -> Result<()> {
        if bucket_size == 0 {
            return Err(Error::State("internal bucket size must be positive"));
        }
        self.internal_bucket_size = bucket_size;
        self.blob_files.clear();
        self.bounding_grid = None;
        self.n_splats = 0;

        let tmp = match tmp_dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(|e| Error::io("blob-index", e))?;
        let to_buckets = SplatToBuckets::new(spacing, bucket_size);

        let mut bbox = Bbox::default();
        let mut n_blobs = 0u64;
        let mut written = 0u64;
        let base = self.base.clone();
        {
            let mut out = BufWriter::new(tmp.as_file());
            let mut stream = base.stream();
            let mut buf = vec![Splat::zeroed(); BUILD_BUFFER];
            let mut ids = vec![0u64; BUILD_BUFFER];
            loop {
                let n = stream.read(&mut buf, &mut ids)?;
                if n == 0 {
                    break;
                }
                let max_slices = crate::math::div_up(n as u64, MIN_SLICE as u64) as usize;
                let slices = rayon::current_num_threads().clamp(1, max_slices.max(1));
                let splats = &buf[..n];
                let splat_ids = &ids[..n];
                let parts: Vec<SlicePart> = (0..slices)
                    .into_par_iter()
                    .map(|tid| {
                        let first = tid * n / slices;
                        let last = (tid + 1) * n / slices;
                        build_slice(&splats[first..last], &splat_ids[first..last], &to_buckets)
                    })
                    .collect();
                for part in parts {
                    bbox.merge(&part.bbox);
                    n_blobs += part.n_blobs;
                    written += 4 * part.words.len() as u64;
                    for word in &part.words {
                        out.write_all(&word.to_le_bytes())
                            .map_err(|e| Error::io(tmp.path(), e))?;
                    }
                }
                self.n_splats += n as u64;
                if let Some(p) = progress {
                    p.add(n as u64);
                }
            }
            out.flush().map_err(|e| Error::io(tmp.path(), e))?;
        }

        let non_finite = self.base.non_finite_count();
        if non_finite > 0 {
            log::warn!("input contains {non_finite} splat(s) with non-finite values");
            if let Some(p) = progress {
                p.add(non_finite);
            }
        }
        let stats = Registry::global();
        stats.counter("blobset.blobs").add(n_blobs);
        stats.counter("blobset.blobs.size").add(written);
        stats.counter("blobset.nonfinite").add(non_finite);

        if bbox.is_empty() {
            return Err(Error::State("input contains no splats"));
        }
        self.bounding_grid = Some(make_bounding_grid(spacing, bucket_size, &bbox));
        self.blob_files.push(BlobFile { file: tmp, n_blobs });
        log::debug!(
            "blob index: {} blobs ({} bytes) for {} splats",
            n_blobs,
            written,
            self.n_splats
        );
        Ok(())
    }

    /// True iff the blob index can stand in for a splat scan on this grid.
    fn fast_path(&self, grid: &Grid, bucket_size: u32) -> Result<bool> {
        if self.internal_bucket_size == 0 {
            return Err(Error::State("blob index has not been computed"));
        }
        let bounding = self.bounding_grid()?;
        if bucket_size % self.internal_bucket_size != 0 {
            return Ok(false);
        }
        if bounding.spacing() != grid.spacing() {
            return Ok(false);
        }
        if grid.reference() != Vec3::ZERO {
            return Ok(false);
        }
        for i in 0..3 {
            if grid.extent(i).0 % self.internal_bucket_size as i32 != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stream blob coverage for `grid` at the given bucket size.
    pub fn blob_stream(&self, grid: &Grid, bucket_size: u32) -> Result<BlobStream<'_>> {
        if bucket_size == 0 {
            return Err(Error::State("bucket size must be positive"));
        }
        if self.fast_path(grid, bucket_size)? {
            Ok(BlobStream::Fast(FastBlobStream::new(
                self,
                grid,
                bucket_size,
            )))
        } else {
            log::debug!("blob index unusable for this grid, falling back to splat scan");
            Ok(BlobStream::Scan(ScanBlobStream::new(
                self.base.as_ref(),
                *grid,
                bucket_size,
            )))
        }
    }
}

fn make_bounding_grid(spacing: f32, bucket_size: u32, bbox: &Bbox) -> Grid {
    let b = bucket_size as i64;
    let mut extents = [(0i32, 0i32); 3];
    for i in 0..3 {
        let lo = (bbox.min[i] / spacing).floor() as i64;
        let hi = (bbox.max[i] / spacing).ceil() as i64;
        // The lower extent must be a multiple of the bucket size, so that the
        // blob data aligns with the grid's buckets.
        let lo = div_down(lo, b) * b;
        extents[i] = (lo as i32, hi as i32);
    }
    Grid::new(Vec3::ZERO, spacing, extents)
}

/// Blob coverage stream: either a replay of the on-disk index or a splat scan.
pub enum BlobStream<'a> {
    Fast(FastBlobStream<'a>),
    Scan(ScanBlobStream<'a>),
}

impl BlobStream<'_> {
    /// Next blob, or `None` at end of stream.
    pub fn next_blob(&mut self) -> Result<Option<BlobInfo>> {
        match self {
            BlobStream::Fast(s) => s.next_blob(),
            BlobStream::Scan(s) => s.next_blob(),
        }
    }
}

/// Replays blob files, rescaling coordinates to the caller's bucket size.
pub struct FastBlobStream<'a> {
    files: &'a [BlobFile],
    cur_file: usize,
    reader: Option<BufReader<File>>,
    remaining: u64,
    raw: BlobInfo,
    divider: i64,
    offset: [i32; 3],
}

impl<'a> FastBlobStream<'a> {
    fn new(owner: &'a FastBlobSet, grid: &Grid, bucket_size: u32) -> Self {
        let internal = owner.internal_bucket_size as i32;
        let mut offset = [0i32; 3];
        for i in 0..3 {
            // Exact: the fast-path check guarantees divisibility.
            offset[i] = grid.extent(i).0 / internal;
        }
        Self {
            files: &owner.blob_files,
            cur_file: 0,
            reader: None,
            remaining: 0,
            raw: BlobInfo::default(),
            divider: (bucket_size / owner.internal_bucket_size) as i64,
            offset,
        }
    }

    pub fn next_blob(&mut self) -> Result<Option<BlobInfo>> {
        while self.remaining == 0 {
            if self.reader.take().is_some() {
                self.cur_file += 1;
            }
            match self.files.get(self.cur_file) {
                None => return Ok(None),
                Some(bf) => {
                    let file = File::open(bf.file.path())
                        .map_err(|e| Error::io(bf.file.path(), e))?;
                    self.reader = Some(BufReader::new(file));
                    self.remaining = bf.n_blobs;
                }
            }
        }
        let cur_file = self.cur_file;
        let files = self.files;
        let reader = self
            .reader
            .as_mut()
            .ok_or(Error::State("blob reader missing"))?;
        if let Err(e) = decode_record(reader, &mut self.raw) {
            return Err(Error::io(files[cur_file].file.path(), e));
        }
        self.remaining -= 1;

        let mut out = self.raw;
        for i in 0..3 {
            out.lower[i] = div_down((self.raw.lower[i] - self.offset[i]) as i64, self.divider) as i32;
            out.upper[i] = div_down((self.raw.upper[i] - self.offset[i]) as i64, self.divider) as i32;
        }
        Ok(Some(out))
    }
}

/// Fallback stream computing one blob per splat from a fresh scan.
pub struct ScanBlobStream<'a> {
    stream: FileSetStream<'a>,
    grid: Grid,
    bucket_size: u32,
    buf: Vec<Splat>,
    ids: Vec<u64>,
    pos: usize,
    len: usize,
}

impl<'a> ScanBlobStream<'a> {
    fn new(set: &'a FileSet, grid: Grid, bucket_size: u32) -> Self {
        Self {
            stream: set.stream(),
            grid,
            bucket_size,
            buf: vec![Splat::zeroed(); 4096],
            ids: vec![0u64; 4096],
            pos: 0,
            len: 0,
        }
    }

    pub fn next_blob(&mut self) -> Result<Option<BlobInfo>> {
        if self.pos == self.len {
            self.len = self.stream.read(&mut self.buf, &mut self.ids)?;
            self.pos = 0;
            if self.len == 0 {
                return Ok(None);
            }
        }
        let splat = self.buf[self.pos];
        let id = self.ids[self.pos];
        self.pos += 1;
        let (lower, upper) = splat_to_buckets(&splat, &self.grid, self.bucket_size);
        Ok(Some(BlobInfo {
            first_splat: id,
            last_splat: id + 1,
            lower,
            upper,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::set::VecSplatFile;

    fn blob(first: u64, last: u64, lower: [i32; 3], upper: [i32; 3]) -> BlobInfo {
        BlobInfo {
            first_splat: first,
            last_splat: last,
            lower,
            upper,
        }
    }

    fn decode_all(words: &[u32], count: usize) -> Vec<BlobInfo> {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let mut cursor = io::Cursor::new(bytes);
        let mut cur = BlobInfo::default();
        let mut out = Vec::new();
        for _ in 0..count {
            decode_record(&mut cursor, &mut cur).unwrap();
            out.push(cur);
        }
        assert_eq!(cursor.position(), cursor.get_ref().len() as u64);
        out
    }

    #[test]
    fn test_bitfields_roundtrip() {
        for v in -4..=3 {
            let payload = insert_signed(0, v, 4, 7);
            assert_eq!(extract_signed(payload, 4, 7), v);
        }
        let payload = insert_unsigned(0, 0x7ffff, 12, 31);
        assert_eq!(extract_unsigned(payload, 12, 31), 0x7ffff);
    }

    #[test]
    fn test_full_then_differential() {
        let a = blob(0, 5, [1, 1, 1], [2, 2, 2]);
        let b = blob(5, 6, [2, 2, 2], [2, 3, 2]);
        let mut words = Vec::new();
        encode_blob(&mut words, None, &a);
        assert_eq!(words.len(), 10);
        encode_blob(&mut words, Some(&a), &b);
        assert_eq!(words.len(), 11);
        assert_ne!(words[10] & DIFF_TAG, 0);
        assert_eq!(decode_all(&words, 2), vec![a, b]);
    }

    #[test]
    fn test_delta_minus_four_fits_minus_five_does_not() {
        let a = blob(0, 1, [0, 0, 0], [0, 0, 0]);
        // lower exactly prev.upper - 4, size 2 per axis: representable
        let b = blob(1, 2, [-4, -4, -4], [-3, -3, -3]);
        let mut words = Vec::new();
        encode_blob(&mut words, Some(&a), &b);
        assert_eq!(words.len(), 1);

        // lower at prev.upper - 5 forces a full record
        let c = blob(1, 2, [-5, 0, 0], [-5, 0, 0]);
        let mut words = Vec::new();
        encode_blob(&mut words, Some(&a), &c);
        assert_eq!(words.len(), 10);
        assert_eq!(words[0] & DIFF_TAG, 0);
    }

    #[test]
    fn test_differential_requires_contiguous_ids() {
        let a = blob(0, 5, [0, 0, 0], [0, 0, 0]);
        let b = blob(6, 7, [0, 0, 0], [0, 0, 0]);
        let mut words = Vec::new();
        encode_blob(&mut words, Some(&a), &b);
        assert_eq!(words.len(), 10);
    }

    #[test]
    fn test_differential_requires_small_box() {
        let a = blob(0, 5, [0, 0, 0], [0, 0, 0]);
        let b = blob(5, 6, [0, 0, 0], [0, 0, 2]);
        let mut words = Vec::new();
        encode_blob(&mut words, Some(&a), &b);
        assert_eq!(words.len(), 10);
    }

    #[test]
    fn test_wire_roundtrip_bit_exact() {
        let blobs = vec![
            blob(0, 3, [-7, 2, 9], [-6, 2, 9]),
            blob(3, 4, [-6, 2, 9], [-6, 3, 10]),
            blob(4, 1000, [-6, 2, 9], [-5, 2, 9]),
            blob(1000, 1000 + (1 << 19), [-5, 2, 9], [-5, 2, 9]), // count too big: full
            blob(2_000_000, 2_000_001, [100, -200, 0], [101, -200, 0]), // gap: full
            blob(2_000_001, 2_000_002, [103, -198, 1], [103, -198, 1]),
        ];
        let mut words = Vec::new();
        let mut prev: Option<BlobInfo> = None;
        for b in &blobs {
            encode_blob(&mut words, prev.as_ref(), b);
            prev = Some(*b);
        }
        assert_eq!(decode_all(&words, blobs.len()), blobs);
    }

    fn colinear_set() -> FileSet {
        let splats = vec![
            Splat::new(Vec3::new(0.0, 0.0, 0.0), Vec3::Z, 0.1),
            Splat::new(Vec3::new(0.0, 0.0, 1.0), Vec3::Z, 0.1),
            Splat::new(Vec3::new(0.0, 0.0, 2.0), Vec3::Z, 0.1),
        ];
        let mut set = FileSet::new();
        set.add_file(Box::new(VecSplatFile::new(splats))).unwrap();
        set
    }

    #[test]
    fn test_colinear_splats_compress_differentially() {
        let mut set = FastBlobSet::new(Arc::new(colinear_set()));
        set.compute_blobs(1.0, 1, None, None).unwrap();
        assert_eq!(set.n_splats(), 3);

        let bf = &set.blob_files[0];
        assert_eq!(bf.n_blobs, 3);
        // One full record plus two differential ones
        let bytes = bf.file.as_file().metadata().unwrap().len();
        assert_eq!(bytes, 40 + 4 + 4);

        let grid = *set.bounding_grid().unwrap();
        let mut stream = set.blob_stream(&grid, 1).unwrap();
        assert!(matches!(stream, BlobStream::Fast(_)));
        let mut blobs = Vec::new();
        while let Some(b) = stream.next_blob().unwrap() {
            blobs.push(b);
        }
        assert_eq!(blobs.len(), 3);
        // Grid lower is (-1,-1,-1); emitted coordinates are grid-relative
        assert_eq!(blobs[0].lower, [0, 0, 0]);
        assert_eq!(blobs[0].upper, [1, 1, 1]);
        assert_eq!(blobs[2].lower, [0, 0, 2]);
        assert_eq!(blobs[2].upper, [1, 1, 3]);
        assert_eq!(blobs[1].first_splat, 1);
        assert_eq!(blobs[1].last_splat, 2);
    }

    #[test]
    fn test_bounding_grid_alignment() {
        let mut set = FastBlobSet::new(Arc::new(colinear_set()));
        set.compute_blobs(0.5, 4, None, None).unwrap();
        let grid = set.bounding_grid().unwrap();
        assert_eq!(grid.reference(), Vec3::ZERO);
        for i in 0..3 {
            assert_eq!(grid.extent(i).0.rem_euclid(4), 0);
            assert!(grid.extent(i).0 < grid.extent(i).1);
        }
    }

    #[test]
    fn test_fast_path_requires_alignment() {
        let mut set = FastBlobSet::new(Arc::new(colinear_set()));
        set.compute_blobs(1.0, 2, None, None).unwrap();
        // Bucket size not a multiple of the internal size: splat scan
        let grid = *set.bounding_grid().unwrap();
        let stream = set.blob_stream(&grid, 3).unwrap();
        assert!(matches!(stream, BlobStream::Scan(_)));
        // Offset reference point: splat scan
        let offgrid = Grid::new(Vec3::ONE, 1.0, [(-2, 4), (-2, 4), (-2, 4)]);
        let stream = set.blob_stream(&offgrid, 2).unwrap();
        assert!(matches!(stream, BlobStream::Scan(_)));
    }

    #[test]
    fn test_scan_stream_covers_all_splats() {
        let mut set = FastBlobSet::new(Arc::new(colinear_set()));
        set.compute_blobs(1.0, 1, None, None).unwrap();
        let offgrid = Grid::new(Vec3::ONE, 1.0, [(-4, 4), (-4, 4), (-4, 4)]);
        let mut stream = set.blob_stream(&offgrid, 2).unwrap();
        let mut count = 0;
        while let Some(b) = stream.next_blob().unwrap() {
            assert_eq!(b.last_splat, b.first_splat + 1);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_blob_stream_before_compute_is_state_error() {
        let set = FastBlobSet::new(Arc::new(colinear_set()));
        let grid = Grid::new(Vec3::ZERO, 1.0, [(0, 4), (0, 4), (0, 4)]);
        assert!(matches!(
            set.blob_stream(&grid, 1),
            Err(Error::State(_))
        ));
    }
}
