//! `kitgfx`: an image-instance coordinator for terminals implementing the
//! [Kitty graphics protocol](https://sw.kovidgoyal.net/kitty/graphics-protocol/).
//!
//! Given a source image and a target cell box, `kitgfx` fingerprints the
//! pair, assigns or reuses a stable identifier in the configured id space,
//! transcodes and caches the resized/re-encoded image, uploads it to the
//! terminal over one of the supported transports, and returns the Unicode
//! placeholder grid that actually displays it.
//!
//! No process-wide singleton: [`Config`](config::Config),
//! [`TerminalIdentity`](terminal::TerminalIdentity), the id
//! [`Database`](db::Database), and the transcode [`Cache`](cache::Cache)
//! are plain values, constructed once in `main` and threaded explicitly into
//! a [`Coordinator`](coordinator::Coordinator).

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod formula;
pub mod idspace;
pub mod placeholder;
pub mod terminal;
pub mod transport;

pub use error::{Error, Result};
