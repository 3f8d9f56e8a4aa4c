//! CLI tool for refreshing and inspecting marketlake stores.

mod error;
mod file_source;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use marketlake_core::{
    EngineConfig, QueryOptions, RefreshScheduler, StoreConfig, TableLocation, TableStore,
    guard::AccessGuard,
    predicate::Predicate,
    record::RecordIndex,
    row::{Row, parse_date, parse_timestamp},
    table::Connector,
};
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use tracing_subscriber::EnvFilter;

use crate::{
    error::{
        CliResult, EncodeSnafu, InstallLoggingSnafu, InvalidDateSnafu, InvalidInstantSnafu,
        InvalidLogLevelSnafu, InvalidPredicateSnafu, LoadConfigSnafu, LockSnafu, RecordSnafu,
        RefreshSnafu, SourceMissingSnafu, TableSnafu, WriteOutputSnafu,
    },
    file_source::{DirectorySource, ensure_dir},
};

#[derive(Debug, Subcommand)]
enum Command {
    /// Refresh levels from a file-drop source directory
    Refresh {
        /// Repeatable level names (default: every configured level)
        #[arg(long = "level")]
        level: Vec<String>,

        /// Directory holding <level>/entities.json and <level>/rows.jsonl
        #[arg(long)]
        source: PathBuf,

        /// Pin the clock, e.g. 2020-01-31T10:00:00
        #[arg(long = "as-of")]
        as_of: Option<String>,
    },

    /// Delete entities' rows and backfill them again from inception
    Reinit {
        #[arg(long)]
        level: String,

        /// Repeatable entity codes
        #[arg(long = "code", required = true)]
        code: Vec<String>,

        #[arg(long)]
        source: PathBuf,

        #[arg(long = "as-of")]
        as_of: Option<String>,
    },

    /// Print matching rows as JSON lines
    Query {
        #[arg(long)]
        level: String,

        /// Repeatable entity codes
        #[arg(long = "code")]
        code: Vec<String>,

        /// First day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Extra filter, e.g. "close > 10 and name = 'abc'"
        #[arg(long = "where")]
        filter: Option<String>,

        /// Combine --where with the date range using OR instead of AND
        #[arg(long, default_value_t = false)]
        or: bool,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Compact a level and rebuild its entity index
    CreateIndex {
        #[arg(long)]
        level: String,
    },

    /// Drop rows with duplicate keys
    Dedup {
        #[arg(long)]
        level: String,

        /// Repeatable key columns (default: the level's key columns)
        #[arg(long = "column")]
        column: Vec<String>,
    },

    /// Recompute the per-entity record ledger from stored rows
    UpdateRecord {
        #[arg(long)]
        level: String,
    },

    /// Print the per-entity record ledger
    Record {
        #[arg(long)]
        level: String,

        #[arg(long)]
        code: Option<String>,
    },

    /// Summarize a level
    Describe {
        #[arg(long)]
        level: String,
    },

    /// List held level locks
    Locks,

    /// Clear a stale level lock
    Unlock {
        #[arg(long)]
        level: String,
    },
}

#[derive(Debug, Parser)]
#[command(name = "mlake")]
struct Cli {
    /// Store configuration (TOML)
    #[arg(long, global = true, default_value = "marketlake.toml")]
    config: PathBuf,

    /// Store root directory
    #[arg(long, global = true, default_value = ".")]
    store: PathBuf,

    /// Log filter, e.g. info or marketlake_core=debug (default: RUST_LOG, then info)
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

fn init_logging(spec: Option<&str>) -> CliResult<()> {
    let filter = match spec {
        Some(spec) => EnvFilter::try_new(spec).map_err(|e| {
            InvalidLogLevelSnafu {
                spec,
                message: e.to_string(),
            }
            .build()
        })?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| {
            InstallLoggingSnafu {
                message: e.to_string(),
            }
            .build()
        })
}

async fn open_store(config: &Path, root: &Path) -> CliResult<(EngineConfig, TableStore)> {
    let (engine, registry) = StoreConfig::load(config)
        .await
        .and_then(StoreConfig::into_parts)
        .context(LoadConfigSnafu { path: config })?;
    let store = TableStore::open(TableLocation::local(root), Arc::new(registry));
    Ok((engine, store))
}

fn parse_day(value: Option<String>) -> CliResult<Option<NaiveDate>> {
    value
        .map(|v| parse_date(&v).context(InvalidDateSnafu { value: v.as_str() }))
        .transpose()
}

fn parse_as_of(value: Option<String>) -> CliResult<NaiveDateTime> {
    match value {
        Some(v) => parse_timestamp(&v).context(InvalidInstantSnafu { value: v.as_str() }),
        None => Ok(Local::now().naive_local()),
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let line = serde_json::to_string(value).context(EncodeSnafu)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").context(WriteOutputSnafu)
}

fn print_rows(rows: &[Row]) -> CliResult<()> {
    let mut out = std::io::stdout().lock();
    for row in rows {
        let line = serde_json::to_string(&row.to_json()).context(EncodeSnafu)?;
        writeln!(out, "{line}").context(WriteOutputSnafu)?;
    }
    out.flush().context(WriteOutputSnafu)
}

fn scheduler_for(
    engine: EngineConfig,
    store: TableStore,
    source: &Path,
) -> CliResult<RefreshScheduler> {
    ensure_dir(source).context(SourceMissingSnafu { path: source })?;
    Ok(RefreshScheduler::new(
        store,
        Arc::new(DirectorySource::new(source)),
        engine,
    ))
}

async fn cmd_refresh(
    engine: EngineConfig,
    store: TableStore,
    levels: Vec<String>,
    source: &Path,
    as_of: Option<String>,
) -> CliResult<()> {
    let now = parse_as_of(as_of)?;
    let scheduler = scheduler_for(engine, store, source)?;
    let reports = scheduler.run_at(&levels, now).await.context(RefreshSnafu)?;
    for report in &reports {
        print_json(report)?;
    }
    Ok(())
}

async fn cmd_reinit(
    engine: EngineConfig,
    store: TableStore,
    level: String,
    codes: Vec<String>,
    source: &Path,
    as_of: Option<String>,
) -> CliResult<()> {
    let now = parse_as_of(as_of)?;
    let scheduler = scheduler_for(engine, store, source)?;
    let summary = scheduler
        .reinit(&level, &codes, now)
        .await
        .context(RefreshSnafu)?;
    print_json(&serde_json::json!({ "level": level, "summary": summary }))
}

struct QueryArgs {
    level: String,
    code: Vec<String>,
    start: Option<String>,
    end: Option<String>,
    filter: Option<String>,
    or: bool,
    limit: Option<usize>,
}

async fn cmd_query(store: &TableStore, args: QueryArgs) -> CliResult<()> {
    let mut options = QueryOptions::default()
        .codes(args.code)
        .between(parse_day(args.start)?, parse_day(args.end)?);
    if let Some(text) = args.filter {
        let predicate = Predicate::parse(&text).context(InvalidPredicateSnafu)?;
        let connector = if args.or { Connector::Or } else { Connector::And };
        options = options.filter(predicate, connector);
    }

    let level = args.level.as_str();
    let mut cursor = match store.query_stream(level, &options).await {
        Ok(cursor) => cursor,
        Err(e) if e.is_missing_table() => return Ok(()),
        Err(e) => return Err(e).context(TableSnafu { level }),
    };

    let mut remaining = args.limit.unwrap_or(usize::MAX);
    while remaining > 0 {
        let Some(mut batch) = cursor.next_batch().await.context(TableSnafu { level })? else {
            break;
        };
        batch.truncate(remaining);
        remaining -= batch.len();
        print_rows(&batch)?;
    }
    Ok(())
}

async fn cmd_create_index(store: &TableStore, level: &str) -> CliResult<()> {
    let guard = AccessGuard::new(store.root().clone());
    let session = guard.enter(level).await.context(LockSnafu)?;
    let result = store.create_index(level).await.context(TableSnafu { level });
    session.release().await.context(LockSnafu)?;
    print_json(&result?)
}

async fn cmd_dedup(store: &TableStore, level: &str, columns: Vec<String>) -> CliResult<()> {
    let guard = AccessGuard::new(store.root().clone());
    let session = guard.enter(level).await.context(LockSnafu)?;
    let keys = (!columns.is_empty()).then_some(columns.as_slice());
    let result = store
        .drop_duplicates(level, keys)
        .await
        .context(TableSnafu { level });
    session.release().await.context(LockSnafu)?;
    print_json(&serde_json::json!({ "level": level, "dropped": result? }))
}

async fn cmd_update_record(store: &TableStore, level: &str) -> CliResult<()> {
    let guard = AccessGuard::new(store.root().clone());
    let session = guard.enter(level).await.context(LockSnafu)?;
    let result = RecordIndex::rebuild(store, level)
        .await
        .context(RecordSnafu { level });
    session.release().await.context(LockSnafu)?;
    let record = result?;
    print_json(&serde_json::json!({ "level": level, "entities": record.len() }))
}

async fn cmd_record(store: &TableStore, level: &str, code: Option<String>) -> CliResult<()> {
    store.dataset(level).context(TableSnafu { level })?;
    let record = RecordIndex::load(store.level_location(level))
        .await
        .context(RecordSnafu { level })?;

    for (entity, span) in record.iter() {
        if code.as_deref().is_some_and(|c| c != entity) {
            continue;
        }
        print_json(&serde_json::json!({
            "code": entity,
            "min": span.min,
            "max": span.max,
        }))?;
    }
    Ok(())
}

async fn cmd_describe(store: &TableStore, level: &str) -> CliResult<()> {
    let description = store.describe(level).await.context(TableSnafu { level })?;
    let text = serde_json::to_string_pretty(&description).context(EncodeSnafu)?;
    println!("{text}");
    Ok(())
}

async fn cmd_locks(store: &TableStore) -> CliResult<()> {
    let guard = AccessGuard::new(store.root().clone());
    let held = guard.held_locks().await.context(LockSnafu)?;
    if held.is_empty() {
        eprintln!("No locks held");
    }
    for info in &held {
        print_json(info)?;
    }
    Ok(())
}

async fn cmd_unlock(store: &TableStore, level: &str) -> CliResult<()> {
    store.dataset(level).context(TableSnafu { level })?;
    let guard = AccessGuard::new(store.root().clone());
    if guard.force_unlock(level).await.context(LockSnafu)? {
        println!("Cleared lock on {level}");
    } else {
        println!("No lock held on {level}");
    }
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;
    let (engine, store) = open_store(&cli.config, &cli.store).await?;

    match cli.cmd {
        Command::Refresh {
            level,
            source,
            as_of,
        } => cmd_refresh(engine, store, level, &source, as_of).await,

        Command::Reinit {
            level,
            code,
            source,
            as_of,
        } => cmd_reinit(engine, store, level, code, &source, as_of).await,

        Command::Query {
            level,
            code,
            start,
            end,
            filter,
            or,
            limit,
        } => {
            cmd_query(
                &store,
                QueryArgs {
                    level,
                    code,
                    start,
                    end,
                    filter,
                    or,
                    limit,
                },
            )
            .await
        }

        Command::CreateIndex { level } => cmd_create_index(&store, &level).await,
        Command::Dedup { level, column } => cmd_dedup(&store, &level, column).await,
        Command::UpdateRecord { level } => cmd_update_record(&store, &level).await,
        Command::Record { level, code } => cmd_record(&store, &level, code).await,
        Command::Describe { level } => cmd_describe(&store, &level).await,
        Command::Locks => cmd_locks(&store).await,
        Command::Unlock { level } => cmd_unlock(&store, &level).await,
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
