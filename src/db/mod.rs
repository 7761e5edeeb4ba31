//! Concurrent-safe persistent store mapping fingerprints/ids to image
//! instances and per-terminal upload status.
//!
//! One table per concern (spec.md §4.3.1): `instances` keyed by id, a
//! `fingerprint_index` for `lookup_by_fingerprint`, and `upload_status`
//! keyed by `(terminal_id, id)`. `rusqlite`'s own busy handler gives us the
//! "short transactions, retries on busy with bounded exponential backoff"
//! behaviour spec.md §4.3.1/§4.3.4 asks for without a separate lock file.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::idspace::{self, IDSpace, Subspace};

#[derive(Debug, Clone)]
pub struct ImageInstance {
    pub path: String,
    pub mtime_nanos: i128,
    pub byte_size: u64,
    pub cols: u16,
    pub rows: u16,
    pub format: u8,
    pub quality: u8,
    pub id_space: IDSpace,
    pub subspace: Option<Subspace>,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NeedsUpload,
    InProgress,
    Uploaded,
    Dirty,
}

#[derive(Debug, Clone)]
pub struct UploadStatus {
    pub state: UploadState,
    pub reason: Option<String>,
    pub started_at: Option<SystemTime>,
    pub last_progress_at: Option<SystemTime>,
    pub bytes_sent: u64,
    pub uploaded_at: Option<SystemTime>,
    pub uploads_ago: u64,
    pub transport: Option<String>,
    pub description_fingerprint: Option<String>,
}

impl UploadStatus {
    fn needs_upload(reason: &str) -> UploadStatus {
        UploadStatus {
            state: UploadState::NeedsUpload,
            reason: Some(reason.to_string()),
            started_at: None,
            last_progress_at: None,
            bytes_sent: 0,
            uploaded_at: None,
            uploads_ago: 0,
            transport: None,
            description_fingerprint: None,
        }
    }
}

pub enum AssignPolicy {
    ForceId(u32),
    Default,
}

pub enum Query {
    All,
    Last(u32),
    Ids(Vec<u32>),
    Paths(Vec<String>),
}

pub struct Database {
    conn: Connection,
    space: IDSpace,
}

const BUSY_RETRIES: u32 = 8;

impl Database {
    pub fn open(dir: &Path, file_name: &str, space: IDSpace) -> Result<Database> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(file_name))?;
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS instances (
                id INTEGER PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                mtime_nanos TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                cols INTEGER NOT NULL,
                rows INTEGER NOT NULL,
                format INTEGER NOT NULL,
                quality INTEGER NOT NULL,
                subspace_begin INTEGER,
                subspace_end INTEGER,
                atime INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS instances_fingerprint ON instances(fingerprint);
            CREATE TABLE IF NOT EXISTS upload_status (
                terminal_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                state TEXT NOT NULL,
                reason TEXT,
                started_at INTEGER,
                last_progress_at INTEGER,
                bytes_sent INTEGER NOT NULL DEFAULT 0,
                uploaded_at INTEGER,
                uploads_ago INTEGER NOT NULL DEFAULT 0,
                transport TEXT,
                description_fingerprint TEXT,
                PRIMARY KEY (terminal_id, id)
            );
            ",
        )?;
        Ok(Database { conn, space })
    }

    fn retrying<T>(&self, mut f: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match f(&self.conn) {
                Ok(v) => return Ok(v),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < BUSY_RETRIES =>
                {
                    let backoff = Duration::from_millis(10 * 2u64.pow(attempt));
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    return Err(Error::ResourceBusy(attempt));
                }
                Err(e) => return Err(Error::Db(e)),
            }
        }
    }

    pub fn lookup_by_fingerprint(&self, fp: Fingerprint) -> Result<Option<(u32, SystemTime)>> {
        self.retrying(|conn| {
            conn.query_row(
                "SELECT id, atime FROM instances WHERE fingerprint = ?1",
                params![fp.to_hex()],
                |row| {
                    let id: i64 = row.get(0)?;
                    let atime: i64 = row.get(1)?;
                    Ok((id as u32, epoch_to_time(atime)))
                },
            )
            .optional()
        })
    }

    /// Allocate or reuse an id for `fp`/`instance` under `policy`
    /// (spec.md §4.3).
    pub fn assign(
        &self,
        fp: Fingerprint,
        instance: &ImageInstance,
        policy: AssignPolicy,
    ) -> Result<u32> {
        match policy {
            AssignPolicy::ForceId(id) => self.force_id(fp, instance, id),
            AssignPolicy::Default => {
                if let Some((id, _)) = self.lookup_by_fingerprint(fp)? {
                    self.touch(id)?;
                    return Ok(id);
                }
                let id = self.mint(fp, instance)?;
                Ok(id)
            }
        }
    }

    fn mint(&self, fp: Fingerprint, instance: &ImageInstance) -> Result<u32> {
        let mut rng = rand::thread_rng();
        let cleanup_roll: f64 = rng.r#gen();
        let id = loop {
            let candidate = idspace::random_id(self.space, instance.subspace);
            let taken = self.retrying(|conn| {
                conn.query_row(
                    "SELECT 1 FROM instances WHERE id = ?1",
                    params![candidate],
                    |_| Ok(()),
                )
                .optional()
            })?;
            if taken.is_none() {
                break candidate;
            }
        };
        self.insert_instance(id, fp, instance)?;
        let _ = cleanup_roll; // probability check happens in caller via `cleanup`
        Ok(id)
    }

    fn insert_instance(&self, id: u32, fp: Fingerprint, instance: &ImageInstance) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO instances
                 (id, fingerprint, path, mtime_nanos, byte_size, cols, rows, format, quality,
                  subspace_begin, subspace_end, atime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    fp.to_hex(),
                    instance.path,
                    instance.mtime_nanos.to_string(),
                    instance.byte_size as i64,
                    instance.cols,
                    instance.rows,
                    instance.format,
                    instance.quality,
                    instance.subspace.map(|s| s.begin as i64),
                    instance.subspace.map(|s| s.end as i64),
                    now_epoch(),
                ],
            )
        })?;
        Ok(())
    }

    fn touch(&self, id: u32) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "UPDATE instances SET atime = ?1 WHERE id = ?2",
                params![now_epoch(), id],
            )
        })?;
        Ok(())
    }

    /// `FORCE_ID` never fails on collision: steal the id, preserving the old
    /// `description_blob` in upload status until every terminal status for
    /// this id is flipped to `DIRTY` (spec.md §4.3.2).
    fn force_id(&self, fp: Fingerprint, instance: &ImageInstance, id: u32) -> Result<u32> {
        self.insert_instance(id, fp, instance)?;
        self.retrying(|conn| {
            conn.execute(
                "UPDATE upload_status SET state = 'DIRTY', reason = 'description changed'
                 WHERE id = ?1",
                params![id],
            )
        })?;
        Ok(id)
    }

    pub fn status(&self, terminal_id: &str, id: u32) -> Result<UploadStatus> {
        let row = self.retrying(|conn| {
            conn.query_row(
                "SELECT state, reason, started_at, last_progress_at, bytes_sent, uploaded_at,
                        uploads_ago, transport, description_fingerprint
                 FROM upload_status WHERE terminal_id = ?1 AND id = ?2",
                params![terminal_id, id],
                |row| {
                    Ok(UploadStatus {
                        state: parse_state(&row.get::<_, String>(0)?),
                        reason: row.get(1)?,
                        started_at: row.get::<_, Option<i64>>(2)?.map(epoch_to_time),
                        last_progress_at: row.get::<_, Option<i64>>(3)?.map(epoch_to_time),
                        bytes_sent: row.get::<_, i64>(4)? as u64,
                        uploaded_at: row.get::<_, Option<i64>>(5)?.map(epoch_to_time),
                        uploads_ago: row.get::<_, i64>(6)? as u64,
                        transport: row.get(7)?,
                        description_fingerprint: row.get(8)?,
                    })
                },
            )
            .optional()
        })?;
        Ok(row.unwrap_or_else(|| UploadStatus::needs_upload("never uploaded")))
    }

    pub fn mark_in_progress(&self, terminal_id: &str, id: u32, transport: &str) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT INTO upload_status (terminal_id, id, state, started_at, last_progress_at, transport)
                 VALUES (?1, ?2, 'IN_PROGRESS', ?3, ?3, ?4)
                 ON CONFLICT(terminal_id, id) DO UPDATE SET
                    state = 'IN_PROGRESS', started_at = ?3, last_progress_at = ?3, transport = ?4",
                params![terminal_id, id, now_epoch(), transport],
            )
        })?;
        Ok(())
    }

    pub fn progress(&self, terminal_id: &str, id: u32, bytes_sent: u64) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "UPDATE upload_status SET last_progress_at = ?1, bytes_sent = ?2
                 WHERE terminal_id = ?3 AND id = ?4",
                params![now_epoch(), bytes_sent as i64, terminal_id, id],
            )
        })?;
        Ok(())
    }

    pub fn mark_uploaded(
        &self,
        terminal_id: &str,
        id: u32,
        bytes: u64,
        description_fingerprint: &str,
    ) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT INTO upload_status
                    (terminal_id, id, state, uploaded_at, bytes_sent, uploads_ago, description_fingerprint)
                 VALUES (?1, ?2, 'UPLOADED', ?3, ?4, 1, ?5)
                 ON CONFLICT(terminal_id, id) DO UPDATE SET
                    state = 'UPLOADED', uploaded_at = ?3, bytes_sent = ?4,
                    uploads_ago = uploads_ago + 1, description_fingerprint = ?5, reason = NULL",
                params![terminal_id, id, now_epoch(), bytes as i64, description_fingerprint],
            )
        })?;
        Ok(())
    }

    pub fn mark_dirty(&self, terminal_id: &str, id: u32, reason: &str) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT INTO upload_status (terminal_id, id, state, reason)
                 VALUES (?1, ?2, 'DIRTY', ?3)
                 ON CONFLICT(terminal_id, id) DO UPDATE SET state = 'DIRTY', reason = ?3",
                params![terminal_id, id, reason],
            )
        })?;
        Ok(())
    }

    pub fn list(&self, query: Query) -> Result<Vec<(u32, ImageInstance)>> {
        let (clause, order) = match &query {
            Query::All => (String::new(), " ORDER BY atime DESC"),
            Query::Last(_) => (String::new(), " ORDER BY atime DESC LIMIT ?"),
            Query::Ids(ids) => (
                format!(
                    " WHERE id IN ({})",
                    ids.iter().map(|_| "?").collect::<Vec<_>>().join(",")
                ),
                " ORDER BY atime DESC",
            ),
            Query::Paths(paths) => (
                format!(
                    " WHERE path IN ({})",
                    paths.iter().map(|_| "?").collect::<Vec<_>>().join(",")
                ),
                " ORDER BY atime DESC",
            ),
        };
        let sql = format!(
            "SELECT id, path, mtime_nanos, byte_size, cols, rows, format, quality,
                    subspace_begin, subspace_end
             FROM instances{clause}{order}"
        );
        self.retrying(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows: rusqlite::Result<Vec<(u32, ImageInstance)>> = match &query {
                Query::Last(n) => stmt
                    .query_map(params![n], row_to_instance)?
                    .collect(),
                Query::Ids(ids) => {
                    let params: Vec<&dyn rusqlite::ToSql> =
                        ids.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                    stmt.query_map(params.as_slice(), row_to_instance)?.collect()
                }
                Query::Paths(paths) => {
                    let params: Vec<&dyn rusqlite::ToSql> =
                        paths.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                    stmt.query_map(params.as_slice(), row_to_instance)?.collect()
                }
                Query::All => stmt.query_map([], row_to_instance)?.collect(),
            };
            rows
        })
    }

    pub fn forget(&self, query: Query) -> Result<u64> {
        let ids: Vec<u32> = self.list(query)?.into_iter().map(|(id, _)| id).collect();
        let mut n = 0u64;
        for id in ids {
            n += self.retrying(|conn| conn.execute("DELETE FROM instances WHERE id = ?1", params![id]))? as u64;
            self.retrying(|conn| conn.execute("DELETE FROM upload_status WHERE id = ?1", params![id]))?;
        }
        Ok(n)
    }

    pub fn dirty(&self, terminal_id: &str, query: Query) -> Result<u64> {
        let ids: Vec<u32> = self.list(query)?.into_iter().map(|(id, _)| id).collect();
        let mut n = 0u64;
        for id in ids {
            self.mark_dirty(terminal_id, id, "marked dirty by request")?;
            n += 1;
        }
        Ok(n)
    }

    /// With probability `cleanup_probability`, evict rows until
    /// `count <= max_num_ids` (oldest `atime` first), then delete whole
    /// database files older than `max_age`. spec.md §4.3.3.
    pub fn cleanup(
        &self,
        db_dir: &Path,
        max_age: Duration,
        max_num_ids: u64,
        cleanup_probability: f64,
    ) -> Result<()> {
        let mut rng = rand::thread_rng();
        if rng.r#gen::<f64>() < cleanup_probability {
            self.evict_lru(max_num_ids)?;
        }
        purge_old_db_files(db_dir, max_age)?;
        Ok(())
    }

    fn evict_lru(&self, max_num_ids: u64) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "DELETE FROM instances WHERE id IN (
                    SELECT id FROM instances ORDER BY atime ASC
                    LIMIT MAX(0, (SELECT COUNT(*) FROM instances) - ?1)
                 )",
                params![max_num_ids as i64],
            )
        })?;
        Ok(())
    }
}

fn purge_old_db_files(db_dir: &Path, max_age: Duration) -> Result<()> {
    let Ok(read_dir) = std::fs::read_dir(db_dir) else { return Ok(()) };
    let now = SystemTime::now();
    for entry in read_dir.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        if let Ok(modified) = meta.modified() {
            if now.duration_since(modified).unwrap_or_default() > max_age {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

fn row_to_instance(row: &rusqlite::Row) -> rusqlite::Result<(u32, ImageInstance)> {
    let id: i64 = row.get(0)?;
    let subspace_begin: Option<i64> = row.get(8)?;
    let subspace_end: Option<i64> = row.get(9)?;
    let subspace = match (subspace_begin, subspace_end) {
        (Some(b), Some(e)) => Subspace::new(b as u16, e as u16).ok(),
        _ => None,
    };
    let mtime_nanos: String = row.get(2)?;
    Ok((
        id as u32,
        ImageInstance {
            path: row.get(1)?,
            mtime_nanos: mtime_nanos.parse().unwrap_or(0),
            byte_size: row.get::<_, i64>(3)? as u64,
            cols: row.get(4)?,
            rows: row.get(5)?,
            format: row.get(6)?,
            quality: row.get(7)?,
            id_space: IDSpace::Bit32, // the space is implied by which db file this row lives in
            subspace,
            id: id as u32,
        },
    ))
}

fn parse_state(s: &str) -> UploadState {
    match s {
        "IN_PROGRESS" => UploadState::InProgress,
        "UPLOADED" => UploadState::Uploaded,
        "DIRTY" => UploadState::Dirty,
        _ => UploadState::NeedsUpload,
    }
}

fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn epoch_to_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(path: &str) -> ImageInstance {
        ImageInstance {
            path: path.to_string(),
            mtime_nanos: 1,
            byte_size: 10,
            cols: 5,
            rows: 2,
            format: 0,
            quality: 90,
            id_space: IDSpace::Bit24,
            subspace: None,
            id: 0,
        }
    }

    fn fp(seed: u8) -> Fingerprint {
        crate::fingerprint::compute(
            Path::new(&format!("/tmp/seed-{seed}.png")),
            seed as i128,
            10,
            5,
            2,
            crate::fingerprint::FormatParams { format: crate::cache::Format::Png, quality: 90 },
        )
        .unwrap()
    }

    #[test]
    fn assign_default_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "t.db", IDSpace::Bit24).unwrap();
        let fp1 = fp(1);
        let id1 = db.assign(fp1, &instance("/a.png"), AssignPolicy::Default).unwrap();
        let id2 = db.assign(fp1, &instance("/a.png"), AssignPolicy::Default).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn force_id_steals_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "t.db", IDSpace::Bit24).unwrap();
        let fp1 = fp(1);
        let fp2 = fp(2);
        let id = db.assign(fp1, &instance("/a.png"), AssignPolicy::ForceId(0x123456)).unwrap();
        db.mark_uploaded("term", id, 100, &fp1.to_hex()).unwrap();

        let id2 = db.assign(fp2, &instance("/b.png"), AssignPolicy::ForceId(0x123456)).unwrap();
        assert_eq!(id, id2);

        let status = db.status("term", id2).unwrap();
        assert_eq!(status.state, UploadState::Dirty);
    }

    #[test]
    fn dirty_then_mark_uploaded_restores_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "t.db", IDSpace::Bit24).unwrap();
        let fp1 = fp(1);
        let id = db.assign(fp1, &instance("/a.png"), AssignPolicy::Default).unwrap();
        db.mark_dirty("term", id, "test").unwrap();
        assert_eq!(db.status("term", id).unwrap().state, UploadState::Dirty);
        db.mark_uploaded("term", id, 42, &fp1.to_hex()).unwrap();
        assert_eq!(db.status("term", id).unwrap().state, UploadState::Uploaded);
    }

    #[test]
    fn cleanup_respects_max_num_ids() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "t.db", IDSpace::Bit24).unwrap();
        for i in 0..10u8 {
            db.assign(fp(i), &instance(&format!("/{i}.png")), AssignPolicy::Default).unwrap();
        }
        db.evict_lru(5).unwrap();
        let remaining = db.list(Query::All).unwrap();
        assert!(remaining.len() as u64 <= 5);
    }
}
