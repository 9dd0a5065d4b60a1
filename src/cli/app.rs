use crate::{
    HistoryConfig, HistoryId, HistoryRecord, HistoryRecordStructure, HistorySearch,
    HistoryService, QueryStatus,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

/// Inspect and edit file-backed histories
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding the histories
    #[arg(long, global = true, env = "HISTORYDB_ROOT")]
    pub root: Option<PathBuf>,

    /// Configuration file to load instead of the default one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep parsed documents in memory between reads
    #[arg(long, global = true)]
    pub cache: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a history, or change the fields of an existing one
    Create {
        #[arg(value_parser = parse_id)]
        id: HistoryId,

        /// Comma separated field names
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
    },

    /// Append one record, values in field order
    Append {
        #[arg(value_parser = parse_id)]
        id: HistoryId,

        values: Vec<String>,

        /// Record time in milliseconds since the epoch, now if absent
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Print records in a period, oldest first
    Find {
        #[arg(value_parser = parse_id)]
        id: HistoryId,

        /// Inclusive start in milliseconds since the epoch
        #[arg(long)]
        start: Option<i64>,

        /// Exclusive end in milliseconds since the epoch
        #[arg(long)]
        end: Option<i64>,

        /// Field the keywords are matched against
        #[arg(long)]
        field: Option<String>,

        /// Keyword every printed record must contain
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        #[arg(long)]
        case_sensitive: bool,
    },

    /// Print the most recent records
    Last {
        #[arg(value_parser = parse_id)]
        id: HistoryId,

        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },

    /// Stream matching records newest first, Ctrl-C cancels
    Query {
        #[arg(value_parser = parse_id)]
        id: HistoryId,

        #[arg(long)]
        field: String,

        #[arg(long = "keyword", required = true)]
        keywords: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// List histories stored below a prefix
    List {
        #[arg(value_parser = parse_id)]
        prefix: Option<HistoryId>,
    },

    /// Delete a history and everything below it
    Purge {
        #[arg(value_parser = parse_id)]
        id: HistoryId,
    },

    /// Move a history to a new id
    Move {
        #[arg(value_parser = parse_id)]
        from: HistoryId,

        #[arg(value_parser = parse_id)]
        to: HistoryId,
    },
}

fn parse_id(value: &str) -> std::result::Result<HistoryId, String> {
    HistoryId::parse(value).map_err(|e| e.to_string())
}

fn millis(value: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .with_context(|| format!("timestamp out of range: {}", value))
}

fn record_json(record: &HistoryRecord) -> Value {
    let properties: Map<String, Value> = record
        .properties()
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    json!({
        "timestamp": record.timestamp().timestamp_millis(),
        "properties": properties,
    })
}

fn print_records<'a>(
    out: &mut dyn Write,
    records: impl IntoIterator<Item = &'a HistoryRecord>,
) -> Result<()> {
    for record in records {
        writeln!(out, "{}", record_json(record))?;
    }
    Ok(())
}

impl Cli {
    /// Execute the command, printing to stdout
    pub async fn execute(self) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.execute_with_output(&mut out).await
    }

    /// Resolve the configuration: explicit file, then the default file,
    /// then built-in defaults, with `--root` and `--cache` on top
    pub fn load_config(&self) -> Result<HistoryConfig> {
        let mut config = match &self.config {
            Some(path) => HistoryConfig::load_from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => HistoryConfig::load_default().unwrap_or_default(),
        };

        if let Some(root) = &self.root {
            config.data_dir = Some(root.clone());
        }
        if self.cache {
            config.cache_enabled = true;
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn execute_with_output(self, out: &mut dyn Write) -> Result<()> {
        let config = self.load_config()?;
        debug!(root = %config.history_root().display(), "Opening history store");
        let service = HistoryService::new(config)?;

        match self.command {
            Commands::Create { id, fields } => {
                let structure = HistoryRecordStructure::new(fields)?;
                let history = service.create_history(&id, structure)?;
                writeln!(out, "{}", history.directory().display())?;
            }
            Commands::Append {
                id,
                values,
                timestamp,
            } => {
                let history = service.get_history(&id)?;
                match timestamp {
                    Some(value) => history.writer().add_record(&values, millis(value)?)?,
                    None => history.writer().add_record_now(&values)?,
                }
            }
            Commands::Find {
                id,
                start,
                end,
                field,
                keywords,
                case_sensitive,
            } => {
                let history = service.get_history(&id)?;
                let mut search = HistorySearch::new().case_sensitive(case_sensitive);
                search.start = start.map(millis).transpose()?;
                search.end = end.map(millis).transpose()?;
                if !keywords.is_empty() {
                    let Some(field) = field else {
                        bail!("--keyword needs --field");
                    };
                    search = search.with_keywords(&field, keywords);
                }
                let records = history.reader().find(&search)?;
                print_records(out, records.iter())?;
            }
            Commands::Last { id, count } => {
                let history = service.get_history(&id)?;
                let records = history.reader().find_last(count)?;
                print_records(out, records.iter())?;
            }
            Commands::Query {
                id,
                field,
                keywords,
                limit,
            } => {
                let history = service.get_history(&id)?;
                let query = history
                    .interactive_reader()
                    .find_by_keywords(&keywords, &field, limit)?;

                let wait = query.wait();
                tokio::pin!(wait);
                let status = tokio::select! {
                    status = &mut wait => status?,
                    _ = tokio::signal::ctrl_c() => {
                        query.cancel();
                        wait.await?
                    }
                };
                print_records(out, query.history_records().iter())?;
                if status == QueryStatus::Canceled {
                    info!(query = %query.query_string(), "Query canceled");
                }
            }
            Commands::List { prefix } => {
                let ids = match prefix {
                    Some(prefix) => service.existing_histories(&prefix)?,
                    None => service.history_ids(),
                };
                for id in ids {
                    writeln!(out, "{}", id)?;
                }
            }
            Commands::Purge { id } => {
                service.purge_history(&id)?;
                info!(history = %id, "Purged history");
            }
            Commands::Move { from, to } => {
                let history = service.move_history(&from, &to)?;
                writeln!(out, "{}", history.directory().display())?;
            }
        }

        Ok(())
    }
}
