//! Binary entry point for the key/value store admin tool.
#![forbid(unsafe_code)]

#[path = "kvtool/config.rs"]
mod config;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_kv::{
    Database, DbFlags, EnvInfo, EnvOptions, Environment, ReaderInfo, Stat, Synchronous,
    WriteFlags,
};
use tracing_subscriber::EnvFilter;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(
    name = "kvtool",
    version,
    about = "Inspect and maintain key/value environments",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "KVTOOL_CONFIG",
        help = "TOML file with default_path and an [env] options table"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    open: OpenArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "The path names the data file, not a directory")]
    no_sub_dir: bool,

    #[arg(long, global = true, value_name = "BYTES", help = "Override the map size")]
    map_size: Option<u64>,

    #[arg(long, global = true, value_enum, help = "Commit durability override")]
    synchronous: Option<SynchronousArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print environment and main database statistics")]
    Stat {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,

        #[arg(long, value_name = "NAME", help = "Named database to report")]
        db: Option<String>,
    },
    #[command(about = "List the reader table")]
    Readers {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    #[command(about = "Release reader slots of dead processes")]
    ReaderCheck {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
    #[command(about = "Write a consistent backup of the latest commit")]
    Copy {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        #[arg(value_name = "DEST")]
        dest: PathBuf,

        #[arg(long, help = "Rebuild the trees, leaving out free pages")]
        compact: bool,
    },
    #[command(about = "Print every item of a database")]
    Dump {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,

        #[arg(long, value_name = "NAME", help = "Named database to dump")]
        db: Option<String>,
    },
    #[command(about = "Print the value stored under a key")]
    Get {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        #[arg(value_name = "KEY")]
        key: String,

        #[arg(long, value_name = "NAME", help = "Named database to read")]
        db: Option<String>,
    },
    #[command(about = "Store a value under a key")]
    Put {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        #[arg(value_name = "KEY")]
        key: String,

        #[arg(value_name = "VALUE")]
        value: String,

        #[arg(long, value_name = "NAME", help = "Named database, created if missing")]
        db: Option<String>,

        #[arg(long, help = "Fail if the key already exists")]
        no_overwrite: bool,
    },
    #[command(about = "Delete a key")]
    Del {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        #[arg(value_name = "KEY")]
        key: String,

        #[arg(long, value_name = "NAME", help = "Named database to modify")]
        db: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SynchronousArg {
    Full,
    Normal,
    Off,
}

impl From<SynchronousArg> for Synchronous {
    fn from(mode: SynchronousArg) -> Self {
        match mode {
            SynchronousArg::Full => Synchronous::Full,
            SynchronousArg::Normal => Synchronous::Normal,
            SynchronousArg::Off => Synchronous::Off,
        }
    }
}

#[derive(Serialize)]
struct StatReport {
    info: EnvInfo,
    db: Option<String>,
    stat: Stat,
}

#[derive(Serialize)]
struct ReaderCheckReport {
    cleared: usize,
}

#[derive(Serialize)]
struct CopyReport {
    dest: String,
    compact: bool,
    last_pgno: u64,
}

#[derive(Serialize)]
struct ItemOut {
    key: String,
    value: String,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    let base = build_options(&config.env, &cli.open);

    match cli.command {
        Command::Stat { path, db } => {
            let path = config.resolve_path(path)?;
            let env = open_env(&path, &base, db.is_some(), true)?;
            let txn = env.begin_ro()?;
            let handle = match &db {
                Some(name) => txn.open_db(Some(name.as_str()), DbFlags::empty())?,
                None => Database::MAIN,
            };
            let report = StatReport {
                info: env.info()?,
                db,
                stat: txn.stat(handle)?,
            };
            emit(cli.format, &report, || print_stat_text(&report))?;
        }
        Command::Readers { path } => {
            let env = open_env(&config.resolve_path(path)?, &base, false, true)?;
            let readers = env.reader_list();
            emit(cli.format, &readers, || print_readers_text(&readers))?;
        }
        Command::ReaderCheck { path } => {
            let env = open_env(&config.resolve_path(path)?, &base, false, true)?;
            let report = ReaderCheckReport {
                cleared: env.reader_check()?,
            };
            emit(cli.format, &report, || {
                println!("Cleared {} stale reader slot(s)", report.cleared)
            })?;
        }
        Command::Copy {
            path,
            dest,
            compact,
        } => {
            let env = open_env(&path, &base, false, true)?;
            env.copy(&dest, compact)?;
            let report = CopyReport {
                dest: dest.display().to_string(),
                compact,
                last_pgno: env.info()?.last_pgno,
            };
            emit(cli.format, &report, || {
                println!(
                    "Copied {} to {}{}",
                    path.display(),
                    report.dest,
                    if compact { " (compacted)" } else { "" }
                )
            })?;
        }
        Command::Dump { path, db } => {
            let env = open_env(&config.resolve_path(path)?, &base, db.is_some(), true)?;
            let txn = env.begin_ro()?;
            let handle = match &db {
                Some(name) => txn.open_db(Some(name.as_str()), DbFlags::empty())?,
                None => Database::MAIN,
            };
            let mut cursor = txn.cursor(handle)?;
            let mut items = Vec::new();
            for item in cursor.iter() {
                let (key, value) = item?;
                items.push(ItemOut {
                    key: escape(key),
                    value: escape(value),
                });
            }
            emit(cli.format, &items, || {
                for item in &items {
                    println!("{}\t{}", item.key, item.value);
                }
            })?;
        }
        Command::Get { path, key, db } => {
            let env = open_env(&path, &base, db.is_some(), true)?;
            let txn = env.begin_ro()?;
            let handle = match &db {
                Some(name) => txn.open_db(Some(name.as_str()), DbFlags::empty())?,
                None => Database::MAIN,
            };
            let Some(value) = txn.get(handle, key.as_bytes())? else {
                return Err(format!("key '{key}' not found").into());
            };
            let item = ItemOut {
                key,
                value: escape(value),
            };
            emit(cli.format, &item, || println!("{}", item.value))?;
        }
        Command::Put {
            path,
            key,
            value,
            db,
            no_overwrite,
        } => {
            let env = open_env(&path, &base, db.is_some(), false)?;
            let txn = env.begin_rw()?;
            let handle = match &db {
                Some(name) => txn.open_db(Some(name.as_str()), DbFlags::CREATE)?,
                None => Database::MAIN,
            };
            let flags = if no_overwrite {
                WriteFlags::NO_OVERWRITE
            } else {
                WriteFlags::empty()
            };
            txn.put(handle, key.as_bytes(), value.as_bytes(), flags)?;
            txn.commit()?;
            if cli.format == OutputFormat::Text {
                println!("Stored '{key}'");
            }
        }
        Command::Del { path, key, db } => {
            let env = open_env(&path, &base, db.is_some(), false)?;
            let txn = env.begin_rw()?;
            let handle = match &db {
                Some(name) => txn.open_db(Some(name.as_str()), DbFlags::empty())?,
                None => Database::MAIN,
            };
            txn.del(handle, key.as_bytes(), None)?;
            txn.commit()?;
            if cli.format == OutputFormat::Text {
                println!("Deleted '{key}'");
            }
        }
    }
    Ok(())
}

fn build_options(base: &EnvOptions, args: &OpenArgs) -> EnvOptions {
    let mut opts = base.clone();
    if args.no_sub_dir {
        opts.no_sub_dir = true;
    }
    if let Some(map_size) = args.map_size {
        opts.map_size = map_size;
    }
    if let Some(mode) = args.synchronous {
        opts.synchronous = mode.into();
    }
    opts
}

fn open_env(
    path: &Path,
    base: &EnvOptions,
    named: bool,
    read_only: bool,
) -> Result<Environment, Box<dyn Error>> {
    let mut opts = base.clone();
    if named && opts.max_dbs == 0 {
        opts.max_dbs = 1;
    }
    opts.read_only = opts.read_only || read_only;
    Ok(Environment::open(path, opts)?)
}

/// Printable rendering of raw bytes: ASCII text stays, everything else
/// becomes `\xNN`.
fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_stat_text(report: &StatReport) {
    let info = &report.info;
    println!("Environment:");
    println!(
        "  page_size={} map_size={} last_pgno={} last_txnid={}",
        info.page_size, info.map_size, info.last_pgno, info.last_txnid
    );
    println!(
        "  max_readers={} num_readers={}",
        info.max_readers, info.num_readers
    );
    println!();
    println!("Database {}:", report.db.as_deref().unwrap_or("(main)"));
    let stat = &report.stat;
    println!(
        "  depth={} branch_pages={} leaf_pages={} overflow_pages={} entries={}",
        stat.depth, stat.branch_pages, stat.leaf_pages, stat.overflow_pages, stat.entries
    );
}

fn print_readers_text(readers: &[ReaderInfo]) {
    if readers.is_empty() {
        println!("(no readers)");
        return;
    }
    println!("{:>5} {:>8} {:>20} {:>12}", "slot", "pid", "thread", "txnid");
    for r in readers {
        let txnid = r
            .txnid
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>5} {:>8} {:>20x} {:>12}", r.slot, r.pid, r.tid, txnid);
    }
}
