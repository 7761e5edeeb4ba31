use crate::idspace::IDSpace;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("id {id} does not fit in id space {space:?}")]
    IdOutOfSpace { id: u32, space: IDSpace },
    #[error("invalid subspace {0:?}")]
    InvalidSubspace(String),
    #[error("database busy, gave up after {0} retries")]
    ResourceBusy(u32),
    #[error("transport {0:?} is not supported")]
    TransportUnsupported(String),
    #[error("source path is gone: {0}")]
    PathGone(std::path::PathBuf),
    #[error("cache entry is corrupt: {0}")]
    CacheCorrupt(String),
    #[error("formula error: {0}")]
    Formula(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::error::ImageError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("config error: {0}")]
    Config(String),
}

#[cfg(not(windows))]
impl From<rustix::io::Errno> for Error {
    fn from(errno: rustix::io::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
