use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use tide_types::Oid;

#[derive(Parser)]
#[command(
    name = "tide",
    about = "Tide: a networked transactional object store",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Server to talk to
    #[arg(long, global = true, default_value = "127.0.0.1:8100")]
    pub addr: String,

    /// Bearer token for the handshake
    #[arg(long, global = true)]
    pub token: Option<String>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a storage server
    Serve(ServeArgs),
    /// Print the current state of an object
    Load(LoadArgs),
    /// Commit a new state for an object
    Put(PutArgs),
    /// Allocate fresh object ids
    NewOids(NewOidsArgs),
    /// Show server counters
    Status,
    /// Wait until no commit is in progress
    Quiesce,
    /// Check that the server answers
    Ping,
}

#[derive(Args)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Keep data in this file instead of memory
    #[arg(long)]
    pub file: Option<PathBuf>,
    #[arg(long)]
    pub store: Option<String>,
    #[arg(long)]
    pub read_only: bool,
}

#[derive(Args)]
pub struct LoadArgs {
    #[arg(value_parser = parse_oid)]
    pub oid: Oid,
}

#[derive(Args)]
pub struct PutArgs {
    #[arg(value_parser = parse_oid)]
    pub oid: Oid,
    pub value: String,
    /// Tid the new state is based on; defaults to the current one
    #[arg(long)]
    pub basis: Option<u64>,
}

#[derive(Args)]
pub struct NewOidsArgs {
    #[arg(default_value = "1")]
    pub count: u32,
}

/// Decimal, or hex with a `0x` prefix.
pub fn parse_oid(s: &str) -> Result<Oid, String> {
    if s.starts_with("0x") {
        Oid::from_hex(s).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map(Oid::new).map_err(|e| format!("{s}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve() {
        let cli = Cli::try_parse_from([
            "tide", "serve", "--bind", "0.0.0.0:9000", "--file", "/tmp/t.db", "--read-only",
        ])
        .unwrap();
        if let Command::Serve(args) = cli.command {
            assert_eq!(args.bind, Some("0.0.0.0:9000".parse().unwrap()));
            assert_eq!(args.file, Some(PathBuf::from("/tmp/t.db")));
            assert!(args.read_only);
            assert!(args.config.is_none());
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_load_hex_and_decimal() {
        let cli = Cli::try_parse_from(["tide", "load", "0x1f"]).unwrap();
        if let Command::Load(args) = cli.command {
            assert_eq!(args.oid, Oid::new(31));
        } else { panic!("wrong command"); }
        let cli = Cli::try_parse_from(["tide", "load", "31"]).unwrap();
        assert!(matches!(cli.command, Command::Load(LoadArgs { oid }) if oid == Oid::new(31)));
        assert!(Cli::try_parse_from(["tide", "load", "zebra"]).is_err());
    }

    #[test]
    fn parse_put() {
        let cli = Cli::try_parse_from(["tide", "put", "7", "hello", "--basis", "3"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.oid, Oid::new(7));
            assert_eq!(args.value, "hello");
            assert_eq!(args.basis, Some(3));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_global_options() {
        let cli = Cli::try_parse_from([
            "tide", "ping", "--addr", "db:8100", "--token", "t", "--format", "json", "-v",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Ping));
        assert_eq!(cli.addr, "db:8100");
        assert_eq!(cli.token.as_deref(), Some("t"));
        assert!(matches!(cli.format, OutputFormat::Json));
        assert!(cli.verbose);
    }

    #[test]
    fn parse_new_oids_default() {
        let cli = Cli::try_parse_from(["tide", "new-oids"]).unwrap();
        assert!(matches!(cli.command, Command::NewOids(NewOidsArgs { count: 1 })));
    }
}
