use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use docsync_cache::{ReqwestTransport, SystemClock};
use docsync_core::{
    FileChanges, FileCriteria, FileId, FileStateManager, FileType, QueryParameter, QueryRequest,
    ReadOptions, SyncConfig,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("docsync")
        .version(docsync_core::VERSION)
        .about("Read, query, edit and publish remote documents")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Path to a TOML config file"),
        )
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .global(true)
                .help("Service base URL (overrides config and DOCSYNC_BASE_URL)"),
        )
        .arg(
            Arg::new("company-id")
                .long("company-id")
                .global(true)
                .value_parser(value_parser!(i64))
                .help("Company sent with batch saves"),
        )
        .subcommand(
            Command::new("read")
                .about("Read files with their references and cached query results")
                .arg(
                    Arg::new("ids")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(i64))
                        .help("File ids"),
                )
                .arg(
                    Arg::new("ttl-ms")
                        .long("ttl-ms")
                        .value_parser(value_parser!(u64))
                        .help("Freshness override in milliseconds"),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("List files under folders")
                .arg(
                    Arg::new("path")
                        .long("path")
                        .action(ArgAction::Append)
                        .help("Folder path (repeatable)"),
                )
                .arg(Arg::new("type").long("type").help("Restrict to one file type"))
                .arg(
                    Arg::new("depth")
                        .long("depth")
                        .value_parser(value_parser!(u32))
                        .help("Folder depth"),
                )
                .arg(
                    Arg::new("full")
                        .long("full")
                        .action(ArgAction::SetTrue)
                        .help("Also load full content of listed files"),
                ),
        )
        .subcommand(
            Command::new("query")
                .about("Execute a question, or raw SQL")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_parser(value_parser!(i64))
                        .conflicts_with("sql")
                        .help("Question id"),
                )
                .arg(Arg::new("sql").long("sql").requires("database").help("SQL text"))
                .arg(Arg::new("database").long("database").help("Target database for --sql")),
        )
        .subcommand(
            Command::new("edit")
                .about("Edit a file, optionally publishing the result")
                .arg(
                    Arg::new("id")
                        .required(true)
                        .value_parser(value_parser!(i64))
                        .help("File id"),
                )
                .arg(
                    Arg::new("set")
                        .long("set")
                        .action(ArgAction::Append)
                        .help("Content key=value; value is parsed as JSON when possible"),
                )
                .arg(Arg::new("name").long("name").help("New name"))
                .arg(Arg::new("path").long("path").help("New folder path"))
                .arg(
                    Arg::new("publish")
                        .long("publish")
                        .action(ArgAction::SetTrue)
                        .help("Publish after editing"),
                ),
        )
        .subcommand(
            Command::new("publish").about("Publish a file").arg(
                Arg::new("id")
                    .required(true)
                    .value_parser(value_parser!(i64))
                    .help("File id"),
            ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    tracing::debug!(base_url = %config.base_url, "configuration loaded");

    let transport = Arc::new(ReqwestTransport::new(config.base_url.clone()));
    let files = FileStateManager::connect(config, transport, Arc::new(SystemClock));

    match matches.subcommand() {
        Some(("read", args)) => {
            let ids: Vec<FileId> = args
                .get_many::<i64>("ids")
                .into_iter()
                .flatten()
                .map(|id| FileId(*id))
                .collect();
            let mut options = ReadOptions::default();
            if let Some(ttl) = args.get_one::<u64>("ttl-ms") {
                options = options.with_ttl(Duration::from_millis(*ttl));
            }
            print_json(&files.read_files(&ids, options).await)?;
        }
        Some(("list", args)) => {
            let criteria = FileCriteria {
                paths: args.get_many::<String>("path").into_iter().flatten().cloned().collect(),
                file_type: args
                    .get_one::<String>("type")
                    .map(|t| t.parse::<FileType>())
                    .transpose()
                    .map_err(anyhow::Error::msg)?,
                depth: args.get_one::<u32>("depth").copied(),
            };
            let result = files.read_files_by_criteria(&criteria, !args.get_flag("full")).await;
            if let Some(error) = &result.error {
                bail!("listing failed: {}", error.message);
            }
            print_json(&result)?;
        }
        Some(("query", args)) => {
            let result = if let Some(id) = args.get_one::<i64>("file") {
                let id = FileId(*id);
                files.read_files(&[id], ReadOptions::default()).await;
                files.execute_question(id).await?
            } else if let (Some(sql), Some(database)) =
                (args.get_one::<String>("sql"), args.get_one::<String>("database"))
            {
                let request =
                    QueryRequest::new(sql.clone(), Vec::<QueryParameter>::new(), database.clone());
                files.queries().run_query(request).await?
            } else {
                bail!("pass --file <id> or --sql <text> --database <name>");
            };
            print_json(&*result)?;
        }
        Some(("edit", args)) => {
            let id = FileId(*args.get_one::<i64>("id").context("missing id")?);
            load_one(&files, id).await?;

            let mut changes = FileChanges::default();
            for assignment in args.get_many::<String>("set").into_iter().flatten() {
                let (key, value) = parse_assignment(assignment)?;
                changes = changes.set(key, value);
            }
            if let Some(name) = args.get_one::<String>("name") {
                changes = changes.with_name(name.clone());
            }
            if let Some(path) = args.get_one::<String>("path") {
                changes = changes.with_path(path.clone());
            }

            let state = files.edit_file(id, changes)?;
            if args.get_flag("publish") {
                print_json(&files.publish_file(id).await?)?;
            } else {
                tracing::info!(
                    file = %id,
                    dirty = state.is_dirty(),
                    "edit kept locally; pass --publish to save"
                );
                print_json(&state)?;
            }
        }
        Some(("publish", args)) => {
            let id = FileId(*args.get_one::<i64>("id").context("missing id")?);
            load_one(&files, id).await?;
            print_json(&files.publish_file(id).await?)?;
        }
        _ => {}
    }

    Ok(())
}

fn load_config(matches: &ArgMatches) -> Result<SyncConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::new(),
    }
    .from_env()?;

    if let Some(url) = matches.get_one::<String>("base-url") {
        config = config.with_base_url(url.clone());
    }
    if let Some(company_id) = matches.get_one::<i64>("company-id") {
        config = config.with_company_id(*company_id);
    }
    Ok(config)
}

async fn load_one(files: &FileStateManager, id: FileId) -> Result<()> {
    files.read_files(&[id], ReadOptions::default()).await;
    match files.get(id) {
        Some(state) if state.base.is_some() => Ok(()),
        Some(state) => match state.load_error {
            Some(error) => bail!("could not load file {id}: {}", error.message),
            None => bail!("could not load file {id}"),
        },
        None => bail!("file {id} not found"),
    }
}

fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got {raw:?}");
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn assignment_values_parse_as_json_first() {
        assert_eq!(
            parse_assignment("query=SELECT 2").unwrap(),
            ("query".to_string(), Value::String("SELECT 2".into()))
        );
        assert_eq!(
            parse_assignment("parameters=[]").unwrap(),
            ("parameters".to_string(), Value::Array(vec![]))
        );
        assert!(parse_assignment("no-equals").is_err());
    }
}
