//! Top-level operations (spec.md §4.7): `assign_id`, `upload`, `display`,
//! `fix`, `reupload`, `forget`/`dirty`, `list`. A [`Coordinator`] is a plain
//! value built from a [`Config`] and [`TerminalIdentity`] in `main` and
//! threaded explicitly — no process-wide singleton (spec.md §9).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{Cache, Constraint, Format};
use crate::config::Config;
use crate::db::{AssignPolicy, Database, ImageInstance, Query, UploadState};
use crate::error::Result;
use crate::fingerprint::{self, FormatParams};
use crate::idspace::IDSpace;
use crate::placeholder;
use crate::terminal::TerminalIdentity;
use crate::transport::{self, Method, ProgressSink};

pub struct Coordinator {
    config: Config,
    identity: TerminalIdentity,
    db: Database,
    cache: Cache,
}

#[derive(Debug, Clone, Copy)]
pub struct AssignRequest {
    pub cols: u16,
    pub rows: u16,
    pub format: Format,
    pub quality: u8,
    pub force_id: Option<u32>,
}

#[derive(Debug)]
pub enum UploadDecision {
    /// Nothing to do; the terminal already has this exact content.
    AlreadyUploaded,
    /// Upload is required and was performed.
    Uploaded { bytes: u64, transport: Method },
}

impl Coordinator {
    pub fn open(config: Config) -> Result<Coordinator> {
        let identity = TerminalIdentity::resolve();
        let db_file = identity.db_file_name(config.id_space.name());
        let db = Database::open(&config.id_database_dir, &db_file, config.id_space)?;
        let cache = Cache::open(
            &config.cache_dir,
            config.max_images,
            config.max_total_size_bytes,
            config.cleanup_target,
            config.thumbnail_file_size_tolerance,
        )?;
        Ok(Coordinator { config, identity, db, cache })
    }

    /// Fingerprint `path` and look up or mint an id for it (spec.md §4.2/§4.3).
    pub fn assign_id(&self, path: &Path, req: AssignRequest) -> Result<u32> {
        let (mtime_nanos, byte_size) = fingerprint::file_stat(path)?;
        let fp = fingerprint::compute(
            path,
            mtime_nanos,
            byte_size,
            req.cols,
            req.rows,
            FormatParams { format: req.format, quality: req.quality },
        )?;

        let instance = ImageInstance {
            path: path.to_string_lossy().to_string(),
            mtime_nanos,
            byte_size,
            cols: req.cols,
            rows: req.rows,
            format: req.format as u8,
            quality: req.quality,
            id_space: self.config.id_space,
            subspace: self.config.id_subspace,
            id: 0,
        };

        let policy = match req.force_id {
            Some(id) => AssignPolicy::ForceId(id),
            None => AssignPolicy::Default,
        };
        self.db.assign(fp, &instance, policy)
    }

    /// Decide whether `id` needs a fresh upload to this terminal and, if so,
    /// perform it (spec.md §4.7's upload decision table).
    pub fn upload(
        &self,
        id: u32,
        path: &Path,
        req: AssignRequest,
        method: Method,
        out: &mut impl Write,
    ) -> Result<UploadDecision> {
        let status = self.db.status(&self.identity.session_id, id)?;

        let (mtime_nanos, byte_size) = fingerprint::file_stat(path)?;
        let fp = fingerprint::compute(
            path,
            mtime_nanos,
            byte_size,
            req.cols,
            req.rows,
            FormatParams { format: req.format, quality: req.quality },
        )?;

        if status.state == UploadState::Uploaded
            && status.description_fingerprint.as_deref() == Some(fp.to_hex().as_str())
        {
            return Ok(UploadDecision::AlreadyUploaded);
        }

        let image = image::open(path)?;
        let constraint =
            Constraint { width: Some(req.cols as u32), height: Some(req.rows as u32), format: Some(req.format), max_bytes: None };
        let (cached_path, _impossible) = self.cache.convert(&image, fp, constraint, req.format)?;
        let bytes = std::fs::read(&cached_path)?;

        self.db.mark_in_progress(&self.identity.session_id, id, method_name(method))?;
        let mut sink = DbProgress { db: &self.db, terminal_id: &self.identity.session_id, id };
        let sent = transport::upload(
            out,
            method,
            id,
            &bytes,
            req.cols as u32,
            req.rows as u32,
            req.format,
            Some(&cached_path),
            Duration::from_secs_f64(self.config.upload_stall_timeout_secs),
            &mut sink,
        )?;
        self.db.mark_uploaded(&self.identity.session_id, id, sent, &fp.to_hex())?;

        Ok(UploadDecision::Uploaded { bytes: sent, transport: method })
    }

    /// `assign_id` + `upload` (if needed) + placeholder grid (spec.md §4.7).
    pub fn display(
        &self,
        path: &Path,
        req: AssignRequest,
        method: Method,
        out: &mut impl Write,
    ) -> Result<String> {
        let id = self.assign_id(path, req)?;
        self.upload(id, path, req, method, out)?;
        Ok(placeholder::render_grid(id, self.config.id_space, req.cols, req.rows, self.config.use_line_feeds))
    }

    /// Re-fingerprint and re-upload `id` unconditionally, used when the
    /// terminal's copy is suspected stale (spec.md §4.7 `fix`).
    pub fn fix(&self, id: u32, path: &Path, req: AssignRequest, method: Method, out: &mut impl Write) -> Result<()> {
        self.db.mark_dirty(&self.identity.session_id, id, "fix requested")?;
        self.upload(id, path, req, method, out)?;
        Ok(())
    }

    pub fn reupload(&self, id: u32, path: &Path, req: AssignRequest, method: Method, out: &mut impl Write) -> Result<()> {
        self.fix(id, path, req, method, out)
    }

    pub fn forget(&self, query: Query) -> Result<u64> {
        self.db.forget(query)
    }

    pub fn dirty(&self, query: Query) -> Result<u64> {
        self.db.dirty(&self.identity.session_id, query)
    }

    pub fn list(&self, query: Query) -> Result<Vec<(u32, ImageInstance)>> {
        self.db.list(query)
    }

    pub fn cache_status(&self) -> Result<(u64, u64)> {
        self.cache.status()
    }

    pub fn cleanup(&self) -> Result<()> {
        self.db.cleanup(
            &self.config.id_database_dir,
            Duration::from_secs(self.config.max_db_age_days * 24 * 3600),
            self.config.max_num_ids,
            self.config.cleanup_probability,
        )?;
        self.cache.evict()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn id_space(&self) -> IDSpace {
        self.config.id_space
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config.cache_dir.clone()
    }
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Direct => "direct",
        Method::Stream => "stream",
        Method::File => "file",
        Method::Temp => "temp",
    }
}

struct DbProgress<'a> {
    db: &'a Database,
    terminal_id: &'a str,
    id: u32,
}

impl ProgressSink for DbProgress<'_> {
    fn on_progress(&mut self, bytes_sent: u64) {
        let _ = self.db.progress(self.terminal_id, self.id, bytes_sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::defaults();
        config.id_database_dir = dir.join("db");
        config.cache_dir = dir.join("cache");
        config.id_space = IDSpace::Bit24;
        config
    }

    fn write_png(path: &Path) {
        use image::{ImageBuffer, Rgb};
        let img: image::RgbImage = ImageBuffer::from_pixel(8, 8, Rgb([10, 20, 30]));
        img.save(path).unwrap();
    }

    #[test]
    fn assign_id_is_stable_for_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path);
        let coordinator = Coordinator::open(test_config(dir.path())).unwrap();
        let req = AssignRequest { cols: 4, rows: 2, format: Format::Png, quality: 90, force_id: None };
        let id1 = coordinator.assign_id(&path, req).unwrap();
        let id2 = coordinator.assign_id(&path, req).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn display_uploads_once_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path);
        let coordinator = Coordinator::open(test_config(dir.path())).unwrap();
        let req = AssignRequest { cols: 4, rows: 2, format: Format::Png, quality: 90, force_id: None };
        let mut out = Cursor::new(Vec::new());
        let grid = coordinator.display(&path, req, Method::Direct, &mut out).unwrap();
        assert!(grid.contains('\u{10EEEE}'));

        let id = coordinator.assign_id(&path, req).unwrap();
        let mut out2 = Cursor::new(Vec::new());
        let decision = coordinator.upload(id, &path, req, Method::Direct, &mut out2).unwrap();
        assert!(matches!(decision, UploadDecision::AlreadyUploaded));
        assert!(out2.into_inner().is_empty());
    }
}
