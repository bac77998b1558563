use anyhow::Context;
use colored::Colorize;
use serde_json::json;

use tide_client::{Client, ClientConfig, ClientError};
use tide_server::{ServerConfig, StorageConfig, TideServer};
use tide_types::{ObjectRecord, Tid};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format.clone();
    match &cli.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Load(args) => cmd_load(&cli, args).await,
        Command::Put(args) => cmd_put(&cli, args).await,
        Command::NewOids(args) => {
            let oids = connect(&cli).await?.new_oids(args.count).await?;
            match format {
                OutputFormat::Json => {
                    let oids: Vec<u64> = oids.iter().map(|o| o.as_u64()).collect();
                    println!("{}", json!(oids));
                }
                OutputFormat::Text => {
                    for oid in oids {
                        println!("{}", oid.to_string().cyan());
                    }
                }
            }
            Ok(())
        }
        Command::Status => cmd_status(&cli).await,
        Command::Quiesce => {
            let tid = connect(&cli).await?.quiesce().await?;
            match format {
                OutputFormat::Json => println!("{}", json!({ "tid": tid.as_u64() })),
                OutputFormat::Text => println!(
                    "{} Quiesced at tid {}",
                    "✓".green().bold(),
                    tid.to_string().yellow()
                ),
            }
            Ok(())
        }
        Command::Ping => {
            let client = connect(&cli).await?;
            let tid = client.ping().await?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    json!({ "addr": cli.addr, "current_tid": tid.as_u64() })
                ),
                OutputFormat::Text => println!(
                    "{} {} at tid {}",
                    "✓".green().bold(),
                    cli.addr.bold(),
                    tid.to_string().yellow()
                ),
            }
            Ok(())
        }
    }
}

async fn connect(cli: &Cli) -> anyhow::Result<Client> {
    let mut config = ClientConfig::new(&cli.addr).with_cache_capacity(0);
    config.token = cli.token.clone();
    Client::connect(config)
        .await
        .with_context(|| format!("connecting to {}", cli.addr))
}

async fn cmd_serve(args: &ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_toml_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(path) = &args.file {
        config.storage = StorageConfig::File {
            path: path.clone(),
            sync_mode: Default::default(),
        };
    }
    if let Some(store) = &args.store {
        config.store_name = store.clone();
    }
    config.read_only |= args.read_only;

    let mode = if config.read_only { "read-only " } else { "" };
    println!(
        "{} Serving {}store {} on {}",
        "✓".green().bold(),
        mode,
        config.store_name.yellow(),
        config.bind_addr.to_string().bold()
    );
    TideServer::from_config(config)?.run().await?;
    Ok(())
}

fn print_record(format: &OutputFormat, record: &ObjectRecord) {
    let state = String::from_utf8_lossy(&record.state);
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "oid": record.oid.as_u64(),
                "tid": record.tid.as_u64(),
                "size": record.state.len(),
                "state": state,
            })
        ),
        OutputFormat::Text => {
            println!(
                "{} @ tid {} ({} bytes)",
                record.oid.to_string().cyan().bold(),
                record.tid.to_string().yellow(),
                record.state.len()
            );
            println!("{state}");
        }
    }
}

async fn cmd_load(cli: &Cli, args: &LoadArgs) -> anyhow::Result<()> {
    let record = connect(cli).await?.load(args.oid).await?;
    print_record(&cli.format, &record);
    Ok(())
}

async fn cmd_put(cli: &Cli, args: &PutArgs) -> anyhow::Result<()> {
    let client = connect(cli).await?;
    let basis = match args.basis {
        Some(tid) => Tid::new(tid),
        None => match client.load(args.oid).await {
            Ok(record) => record.tid,
            Err(ClientError::NotFound(_)) => Tid::ZERO,
            Err(e) => return Err(e.into()),
        },
    };
    let tid = client
        .commit(vec![(args.oid, basis, args.value.clone().into_bytes())])
        .await
        .with_context(|| format!("writing {}", args.oid))?;
    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "oid": args.oid.as_u64(), "tid": tid.as_u64() })
        ),
        OutputFormat::Text => println!(
            "{} Committed {} at tid {}",
            "✓".green().bold(),
            args.oid.to_string().cyan(),
            tid.to_string().yellow()
        ),
    }
    Ok(())
}

async fn cmd_status(cli: &Cli) -> anyhow::Result<()> {
    let status = connect(cli).await?.status().await?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => {
            println!(
                "Store {} at tid {}",
                status.store.yellow().bold(),
                status.current_tid.to_string().yellow()
            );
            println!("  Session has seen tid {}", status.session_tid);
            println!("  Sessions: {}", status.sessions.to_string().bold());
            println!(
                "  Open transactions: {} ({} waiting for the lock)",
                status.active_transactions, status.lock_waiters
            );
            println!(
                "  Commits: {}  Aborts: {}  Conflicts: {}",
                status.commits.to_string().green(),
                status.aborts,
                status.conflicts.to_string().red()
            );
            println!(
                "  Loads: {}  Invalidations sent: {}",
                status.loads, status.invalidations_sent
            );
        }
    }
    Ok(())
}
