//! CLI front-end (spec.md §6): `display`, `upload`, `get-id`, `placeholder`,
//! `list`, `fix`, `reupload`, `dirty`, `forget`, `cache {...}`, `status`,
//! `dump-config`, `cleanup`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kitgfx::cache::Format;
use kitgfx::config::Config;
use kitgfx::coordinator::{AssignRequest, Coordinator, UploadDecision};
use kitgfx::db::Query;
use kitgfx::error::Error;
use kitgfx::formula::{self, Vars};
use kitgfx::placeholder;
use kitgfx::transport::Method;

#[derive(Parser)]
#[command(name = "kitgfx", version, about = "Image-instance coordinator for the Kitty graphics protocol")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Columns of the target cell box.
    #[arg(long, global = true, default_value_t = 1)]
    cols: u16,

    /// Rows of the target cell box.
    #[arg(long, global = true, default_value_t = 1)]
    rows: u16,

    #[arg(long, global = true, default_value = "png")]
    format: String,

    #[arg(long, global = true, default_value_t = 90)]
    quality: u8,

    #[arg(long, global = true, default_value = "direct")]
    transport: String,

    #[arg(long, global = true)]
    no_upload: bool,

    #[arg(long, global = true, conflicts_with = "no_upload")]
    force_upload: bool,

    /// Placement offset as "col_formula,row_formula", evaluated with the
    /// `tr tc cx cy ec er` variables (spec.md §4.1).
    #[arg(long, global = true)]
    position: Option<String>,

    #[arg(long, global = true, default_value_t = 80)]
    term_cols: u16,

    #[arg(long, global = true, default_value_t = 24)]
    term_rows: u16,
}

/// Resolve `--position` into an absolute `(col, row)` cursor target, or
/// `None` when the flag wasn't given (the grid is drawn at the current
/// cursor position).
fn resolve_position(
    position: &Option<String>,
    term_cols: u16,
    term_rows: u16,
    cols: u16,
    rows: u16,
) -> kitgfx::Result<Option<(i64, i64)>> {
    let Some(spec) = position else { return Ok(None) };
    let (col_expr, row_expr) = spec
        .split_once(',')
        .ok_or_else(|| Error::InvalidArg(format!("bad --position {spec:?}, expected \"col,row\"")))?;
    let vars = Vars { tr: term_rows as f64, tc: term_cols as f64, cx: 0.0, cy: 0.0, ec: cols as f64, er: rows as f64 };
    let col = formula::eval(col_expr, &vars).map_err(|e| Error::InvalidArg(e.to_string()))?;
    let row = formula::eval(row_expr, &vars).map_err(|e| Error::InvalidArg(e.to_string()))?;
    Ok(Some((col.round() as i64, row.round() as i64)))
}

#[derive(Subcommand)]
enum Command {
    Display { path: PathBuf },
    Upload { id: u32, path: PathBuf },
    GetId { path: PathBuf },
    Placeholder { id: u32 },
    List,
    Fix { id: u32, path: PathBuf },
    Reupload { id: u32, path: PathBuf },
    Dirty { ids: Vec<u32> },
    Forget { ids: Vec<u32> },
    Status,
    DumpConfig,
    Cleanup,
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    List,
    Remove { path: PathBuf },
    Purge,
    Status,
    Cleanup,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("kitgfx: {e}");
            match e {
                Error::InvalidArg(_) | Error::InvalidSubspace(_) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: Cli) -> kitgfx::Result<()> {
    let config = Config::load()?;
    let coordinator = Coordinator::open(config)?;

    let format = parse_format(&cli.format)?;
    let method = Method::parse(&cli.transport)?;
    let req = AssignRequest { cols: cli.cols, rows: cli.rows, format, quality: cli.quality, force_id: None };

    let no_upload = cli.no_upload;
    let force_upload = cli.force_upload;

    match cli.command {
        Command::Display { path } => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let id = coordinator.assign_id(&path, req)?;
            if force_upload {
                coordinator.fix(id, &path, req, method, &mut handle)?;
            } else if !no_upload {
                coordinator.upload(id, &path, req, method, &mut handle)?;
            }
            if let Some((col, row)) = resolve_position(&cli.position, cli.term_cols, cli.term_rows, cli.cols, cli.rows)? {
                print!("\x1b[{};{}H", row + 1, col + 1);
            }
            let grid = placeholder::render_grid(id, coordinator.id_space(), cli.cols, cli.rows, coordinator.config().use_line_feeds);
            print!("{grid}");
        }
        Command::Upload { id, path } => {
            if no_upload {
                return Err(Error::InvalidArg("--no-upload conflicts with the upload command".to_string()));
            }
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let outcome = if force_upload {
                coordinator.fix(id, &path, req, method, &mut handle)?;
                UploadDecision::Uploaded { bytes: 0, transport: method }
            } else {
                coordinator.upload(id, &path, req, method, &mut handle)?
            };
            match outcome {
                UploadDecision::AlreadyUploaded => log::info!("id {id} already uploaded"),
                UploadDecision::Uploaded { bytes, .. } => log::info!("uploaded {bytes} bytes for id {id}"),
            }
        }
        Command::GetId { path } => {
            let id = coordinator.assign_id(&path, req)?;
            println!("{id}");
        }
        Command::Placeholder { id } => {
            if let Some((col, row)) = resolve_position(&cli.position, cli.term_cols, cli.term_rows, cli.cols, cli.rows)? {
                print!("\x1b[{};{}H", row + 1, col + 1);
            }
            let grid = placeholder::render_grid(id, coordinator.id_space(), cli.cols, cli.rows, coordinator.config().use_line_feeds);
            print!("{grid}");
        }
        Command::List => {
            for (id, instance) in coordinator.list(Query::All)? {
                println!("{id}\t{}", instance.path);
            }
        }
        Command::Fix { id, path } => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            coordinator.fix(id, &path, req, method, &mut handle)?;
        }
        Command::Reupload { id, path } => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            coordinator.reupload(id, &path, req, method, &mut handle)?;
        }
        Command::Dirty { ids } => {
            let n = coordinator.dirty(Query::Ids(ids))?;
            log::info!("marked {n} ids dirty");
        }
        Command::Forget { ids } => {
            let n = coordinator.forget(Query::Ids(ids))?;
            log::info!("forgot {n} ids");
        }
        Command::Status => {
            let (count, bytes) = coordinator.cache_status()?;
            println!("cache: {count} entries, {bytes} bytes");
        }
        Command::DumpConfig => {
            print!("{}", coordinator.config().to_toml());
        }
        Command::Cleanup => {
            coordinator.cleanup()?;
        }
        Command::Cache { action } => run_cache_action(&coordinator, action)?,
    }

    Ok(())
}

fn run_cache_action(coordinator: &Coordinator, action: CacheAction) -> kitgfx::Result<()> {
    match action {
        CacheAction::Status => {
            let (count, bytes) = coordinator.cache_status()?;
            println!("{count} entries, {bytes} bytes");
        }
        CacheAction::Purge => {
            // purge/list/remove are exposed on Cache directly; Coordinator
            // only wraps the read path used by the other subcommands.
            let cache = kitgfx::cache::Cache::open(
                &coordinator.cache_dir(),
                coordinator.config().max_images,
                coordinator.config().max_total_size_bytes,
                coordinator.config().cleanup_target,
                coordinator.config().thumbnail_file_size_tolerance,
            )?;
            cache.purge()?;
        }
        CacheAction::List => {
            let cache = kitgfx::cache::Cache::open(
                &coordinator.cache_dir(),
                coordinator.config().max_images,
                coordinator.config().max_total_size_bytes,
                coordinator.config().cleanup_target,
                coordinator.config().thumbnail_file_size_tolerance,
            )?;
            for entry in cache.list(None)? {
                println!("{}\t{}x{}\t{}", entry.source_fingerprint, entry.width, entry.height, entry.byte_size);
            }
        }
        CacheAction::Remove { path } => {
            let cache = kitgfx::cache::Cache::open(
                &coordinator.cache_dir(),
                coordinator.config().max_images,
                coordinator.config().max_total_size_bytes,
                coordinator.config().cleanup_target,
                coordinator.config().thumbnail_file_size_tolerance,
            )?;
            cache.remove(&path)?;
        }
        CacheAction::Cleanup => coordinator.cleanup()?,
    }
    Ok(())
}

fn parse_format(text: &str) -> kitgfx::Result<Format> {
    match text {
        "png" => Ok(Format::Png),
        "jpeg" | "jpg" => Ok(Format::Jpeg),
        other => Err(Error::InvalidArg(format!("unknown format {other:?}"))),
    }
}
