//! Content-addressed cache of resized/re-encoded image variants.
//!
//! Entries live at `cache_dir/objects/<fp>-<w>x<h>-<fmt>-q<quality>.bin`
//! (spec.md §6's `cache_dir/objects/<fp>-<w>x<h>-<fmt>` layout, with the
//! quality folded into the filename since this cache, like the teacher's
//! `ImageSource`, keeps no side-table of metadata). Writers always encode to
//! a unique temporary file under the same directory and rename into place,
//! the same atomic-rename discipline spec.md §4.4.3 and §9 call for.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::DynamicImage;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Format {
    Png = 0,
    Jpeg = 1,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Png => "png",
            Format::Jpeg => "jpeg",
        }
    }

    pub fn wire_code(&self) -> u32 {
        match self {
            Format::Png => 100,
            Format::Jpeg => 100, // transmitted as whatever the terminal decodes; PNG/JPEG both use f=100
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Constraint {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<Format>,
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Hex fingerprint of the source, as recovered from the filename.
    pub source_fingerprint: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub quality: u8,
    pub byte_size: u64,
    pub cached_path: PathBuf,
    pub atime: SystemTime,
}

pub struct Cache {
    objects_dir: PathBuf,
    max_images: u64,
    max_total_size_bytes: u64,
    cleanup_target: f64,
    tolerance: f64,
}

impl Cache {
    pub fn open(
        cache_dir: &Path,
        max_images: u64,
        max_total_size_bytes: u64,
        cleanup_target: f64,
        tolerance: f64,
    ) -> Result<Cache> {
        let objects_dir = cache_dir.join("objects");
        std::fs::create_dir_all(&objects_dir)?;
        Ok(Cache { objects_dir, max_images, max_total_size_bytes, cleanup_target, tolerance })
    }

    /// Convert `source` to satisfy `constraint`, short-circuiting through an
    /// existing entry. Returns the cached path and whether `max_bytes` (if
    /// requested) could not actually be met (the 1x1 floor case).
    pub fn convert(
        &self,
        source: &DynamicImage,
        source_fingerprint: Fingerprint,
        constraint: Constraint,
        source_format: Format,
    ) -> Result<(PathBuf, bool)> {
        if let Some(entry) = self.check(source_fingerprint, constraint)? {
            return Ok((entry.cached_path, false));
        }

        let format = constraint.format.unwrap_or(source_format);
        let (target_w, target_h) = target_dimensions(source, constraint);

        let (bytes, quality, impossible) = if let Some(max_bytes) = constraint.max_bytes {
            encode_within_byte_budget(source, target_w, target_h, format, max_bytes, self.tolerance)?
        } else {
            let resized = resize_to(source, target_w, target_h);
            let bytes = encode(&resized, format, 90)?;
            (bytes, 90, false)
        };

        let width = if constraint.max_bytes.is_some() && impossible { 1 } else { target_w };
        let height = if constraint.max_bytes.is_some() && impossible { 1 } else { target_h };

        let path = self.write_entry(source_fingerprint, width, height, format, quality, &bytes)?;
        self.evict()?;
        Ok((path, impossible))
    }

    /// Look up an entry that already satisfies `constraint`, without
    /// encoding. Exact match on any explicitly requested pixel dimension;
    /// `max_bytes` matches any entry whose recorded size already fits
    /// (spec.md §4.4.2).
    pub fn check(
        &self,
        source_fingerprint: Fingerprint,
        constraint: Constraint,
    ) -> Result<Option<CacheEntry>> {
        let mut best: Option<CacheEntry> = None;
        for entry in self.list(Some(source_fingerprint))? {
            if let Some(format) = constraint.format {
                if entry.format != format {
                    continue;
                }
            }
            if let Some(w) = constraint.width {
                if entry.width != w {
                    continue;
                }
            }
            if let Some(h) = constraint.height {
                if entry.height != h {
                    continue;
                }
            }
            if let Some(max_bytes) = constraint.max_bytes {
                if entry.byte_size as f64 > max_bytes as f64 * (1.0 + self.tolerance) {
                    continue;
                }
            }
            match &best {
                Some(current) if current.byte_size <= entry.byte_size => {}
                _ => best = Some(entry),
            }
        }
        if let Some(entry) = &best {
            touch(&entry.cached_path);
        }
        Ok(best)
    }

    /// List cache entries, optionally filtered to one source.
    pub fn list(&self, source: Option<Fingerprint>) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let Ok(read_dir) = std::fs::read_dir(&self.objects_dir) else {
            return Ok(entries);
        };
        for dirent in read_dir {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(parsed) = parse_name(name) else { continue };
            if let Some(src) = source {
                if parsed.0 != src.to_hex() {
                    continue;
                }
            }
            let meta = match dirent.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(CacheEntry {
                source_fingerprint: parsed.0.clone(),
                width: parsed.1,
                height: parsed.2,
                format: parsed.3,
                quality: parsed.4,
                byte_size: meta.len(),
                cached_path: dirent.path(),
                atime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn purge(&self) -> Result<()> {
        for entry in self.list(None)? {
            std::fs::remove_file(entry.cached_path)?;
        }
        Ok(())
    }

    pub fn status(&self) -> Result<(u64, u64)> {
        let entries = self.list(None)?;
        let count = entries.len() as u64;
        let bytes: u64 = entries.iter().map(|e| e.byte_size).sum();
        Ok((count, bytes))
    }

    /// Delete oldest-atime entries until both the count and total size are
    /// within `max * cleanup_target` (spec.md §4.4.3).
    pub fn evict(&self) -> Result<()> {
        let mut entries = self.list(None)?;
        let count_limit = (self.max_images as f64 * self.cleanup_target) as u64;
        let bytes_limit = (self.max_total_size_bytes as f64 * self.cleanup_target) as u64;

        let mut total: u64 = entries.iter().map(|e| e.byte_size).sum();
        let mut count = entries.len() as u64;
        if count <= self.max_images && total <= self.max_total_size_bytes {
            return Ok(());
        }

        entries.sort_by_key(|e| e.atime);
        for entry in entries {
            if count <= count_limit && total <= bytes_limit {
                break;
            }
            total = total.saturating_sub(entry.byte_size);
            count = count.saturating_sub(1);
            let _ = std::fs::remove_file(&entry.cached_path);
        }
        Ok(())
    }

    fn write_entry(
        &self,
        fp: Fingerprint,
        width: u32,
        height: u32,
        format: Format,
        quality: u8,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let final_name =
            format!("{}-{}x{}-{}-q{}.bin", fp.to_hex(), width, height, format.extension(), quality);
        let final_path = self.objects_dir.join(&final_name);
        if final_path.exists() {
            return Ok(final_path);
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.objects_dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        // Atomic rename into place; a concurrent writer racing to the same
        // name just loses harmlessly, `persist` overwrites are fine because
        // the content for a given name is deterministic.
        let _ = tmp.persist(&final_path);
        Ok(final_path)
    }
}

fn touch(path: &Path) {
    if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}

fn parse_name(name: &str) -> Option<(String, u32, u32, Format, u8)> {
    let stem = name.strip_suffix(".bin")?;
    let mut parts = stem.rsplitn(4, '-');
    let quality_part = parts.next()?;
    let format_part = parts.next()?;
    let dims_part = parts.next()?;
    let fp = parts.next()?.to_string();

    let quality: u8 = quality_part.strip_prefix('q')?.parse().ok()?;
    let format = match format_part {
        "png" => Format::Png,
        "jpeg" => Format::Jpeg,
        _ => return None,
    };
    let (w, h) = dims_part.split_once('x')?;
    let width: u32 = w.parse().ok()?;
    let height: u32 = h.parse().ok()?;
    Some((fp, width, height, format, quality))
}

fn target_dimensions(source: &DynamicImage, constraint: Constraint) -> (u32, u32) {
    let (sw, sh) = (source.width(), source.height());
    match (constraint.width, constraint.height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, ((sh as f64) * (w as f64) / (sw as f64)).round().max(1.0) as u32),
        (None, Some(h)) => (((sw as f64) * (h as f64) / (sh as f64)).round().max(1.0) as u32, h),
        (None, None) => (sw, sh),
    }
}

fn resize_to(source: &DynamicImage, w: u32, h: u32) -> DynamicImage {
    if source.width() == w && source.height() == h {
        source.clone()
    } else {
        source.resize_exact(w.max(1), h.max(1), image::imageops::FilterType::Lanczos3)
    }
}

fn encode(image: &DynamicImage, format: Format, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        Format::Png => {
            image.write_with_encoder(image::codecs::png::PngEncoder::new(&mut buf))?;
        }
        Format::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
            image.write_with_encoder(encoder)?;
        }
    }
    Ok(buf)
}

/// Binary-search the scale factor `s in (0,1]` so the encoded image fits
/// `max_bytes`, within `tolerance` (spec.md §4.4.1). If the source already
/// fits, scale = 1 and no resize happens. If even the 1x1 image exceeds
/// `max_bytes`, that 1x1 result is returned with `impossible = true`.
fn encode_within_byte_budget(
    source: &DynamicImage,
    base_w: u32,
    base_h: u32,
    format: Format,
    max_bytes: u64,
    tolerance: f64,
) -> Result<(Vec<u8>, u8, bool)> {
    let full = resize_to(source, base_w, base_h);
    let full_bytes = encode(&full, format, 90)?;
    if full_bytes.len() as u64 <= max_bytes {
        return Ok((full_bytes, 90, false));
    }

    let (mut lo, mut hi) = (0.0f64, 1.0f64);
    let mut best: Option<Vec<u8>> = None;
    for _ in 0..20 {
        let mid = (lo + hi) / 2.0;
        let w = ((base_w as f64) * mid).round().max(1.0) as u32;
        let h = ((base_h as f64) * mid).round().max(1.0) as u32;
        let candidate = resize_to(source, w, h);
        let bytes = encode(&candidate, format, 90)?;
        if bytes.len() as u64 <= max_bytes {
            best = Some(bytes);
            lo = mid;
        } else {
            hi = mid;
        }
        if (hi - lo) < tolerance {
            break;
        }
    }

    if let Some(bytes) = best {
        return Ok((bytes, 90, false));
    }

    // Even the smallest representable image is over budget: return the 1x1
    // floor and report the impossibility to the caller.
    let one_by_one = resize_to(source, 1, 1);
    let bytes = encode(&one_by_one, format, 90)?;
    Ok((bytes, 90, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn image(w: u32, h: u32) -> DynamicImage {
        ImageBuffer::from_pixel(w, h, Rgb::<u8>([200, 50, 10])).into()
    }

    fn fp(seed: u8) -> Fingerprint {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        std::fs::write(&path, [seed]).unwrap();
        crate::fingerprint::compute(
            &path,
            0,
            1,
            1,
            1,
            crate::fingerprint::FormatParams { format: Format::Png, quality: 90 },
        )
        .unwrap()
    }

    #[test]
    fn convert_then_check_returns_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 100, 10_000_000, 0.8, 0.05).unwrap();
        let src = image(64, 64);
        let fingerprint = fp(1);
        let constraint = Constraint { width: Some(16), ..Default::default() };
        let (path1, _) = cache.convert(&src, fingerprint, constraint, Format::Png).unwrap();
        let found = cache.check(fingerprint, constraint).unwrap().unwrap();
        assert_eq!(found.cached_path, path1);
    }

    #[test]
    fn max_bytes_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 100, 10_000_000, 0.8, 0.05).unwrap();
        let src = image(256, 256);
        let fingerprint = fp(2);
        let constraint = Constraint { max_bytes: Some(2000), ..Default::default() };
        let (path, _impossible) =
            cache.convert(&src, fingerprint, constraint, Format::Png).unwrap();
        let size = std::fs::metadata(path).unwrap().len();
        assert!(size as u64 <= 2000 || size < 200);
    }

    #[test]
    fn impossible_max_bytes_returns_1x1() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 100, 10_000_000, 0.8, 0.05).unwrap();
        let src = image(256, 256);
        let fingerprint = fp(3);
        let constraint = Constraint { max_bytes: Some(5), ..Default::default() };
        let (path, impossible) =
            cache.convert(&src, fingerprint, constraint, Format::Png).unwrap();
        assert!(impossible);
        let parsed = parse_name(path.file_name().unwrap().to_str().unwrap()).unwrap();
        assert_eq!((parsed.1, parsed.2), (1, 1));
    }
}
