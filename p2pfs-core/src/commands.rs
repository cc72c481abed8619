//! Command-line surface
//!
//! The [`Commands`] enum is the command table: clap derives parsing and
//! help from it, and [`COMMAND_TABLE`] records what each entry needs at run
//! time. Local commands only open the blockstore; network commands also
//! start a node for the duration of the command.

use clap::{Parser, Subcommand};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blockexc::ExchangeError;
use crate::config::{Config, ConfigError, GlobalArgs, StartCommand};
use crate::content_id::{parse_cid_str, CidError};
use crate::dag::{list_links, node_payload, DagError};
use crate::importer::{cat, export_file, import_bytes, import_file, ImportError};
use crate::runtime::{run_node, Node, NodeError};
use crate::storage::{Blockstore, StorageError};
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    InvalidIdentifier(#[from] CidError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error(transparent)]
    Import(ImportError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("Demo failed: {0}")]
    Demo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for CommandError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::BlockNotFound(cid) => CommandError::NotFound(cid),
            other => CommandError::Storage(other),
        }
    }
}

impl From<ImportError> for CommandError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Storage(e) => e.into(),
            ImportError::Dag(e) => e.into(),
            other => CommandError::Import(other),
        }
    }
}

impl From<ExchangeError> for CommandError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::NotFound { cid, attempts } | ExchangeError::DeadlineExceeded { cid, attempts } => {
                let tried: Vec<String> = attempts
                    .iter()
                    .map(|a| format!("{} ({})", a.peer, a.reason))
                    .collect();
                if tried.is_empty() {
                    CommandError::NotFound(format!("{} (no peers to ask)", cid))
                } else {
                    CommandError::NotFound(format!("{} (tried {})", cid, tried.join(", ")))
                }
            }
            ExchangeError::Storage(e) => e.into(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "p2pfs")]
#[command(about = "Peer-to-peer content-addressed file store", long_about = None)]
#[command(version, after_help = command_summary())]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Import a file as a single block and print its CID
    Add { file: PathBuf },

    /// Write a locally stored file to OUTPUT
    Get { cid: String, output: PathBuf },

    /// Announce a locally stored block to the network
    Pin { cid: String },

    /// Print a locally stored file to stdout
    Cat { cid: String },

    /// List the links of a locally stored DAG node
    Ls { cid: String },

    /// Retrieve a file from the network, then print or save it
    Fetch {
        cid: String,

        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List files imported on this node
    Files,

    /// Exchange a file between two nodes running in this process
    Demo { file: PathBuf },

    /// Start the node daemon
    Start(StartCommand),
}

/// What a command needs before it can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Blockstore only
    Local,
    /// Blockstore and a running node
    Network,
    /// Manages its own resources
    Standalone,
}

#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub scope: Scope,
    pub summary: &'static str,
}

pub const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec {
        name: "add",
        scope: Scope::Local,
        summary: "import a file",
    },
    CommandSpec {
        name: "get",
        scope: Scope::Local,
        summary: "export a stored file",
    },
    CommandSpec {
        name: "pin",
        scope: Scope::Network,
        summary: "announce a stored block",
    },
    CommandSpec {
        name: "cat",
        scope: Scope::Local,
        summary: "print a stored file",
    },
    CommandSpec {
        name: "ls",
        scope: Scope::Local,
        summary: "list DAG links",
    },
    CommandSpec {
        name: "fetch",
        scope: Scope::Network,
        summary: "retrieve from peers",
    },
    CommandSpec {
        name: "files",
        scope: Scope::Local,
        summary: "list imported files",
    },
    CommandSpec {
        name: "demo",
        scope: Scope::Standalone,
        summary: "two-node exchange",
    },
    CommandSpec {
        name: "start",
        scope: Scope::Standalone,
        summary: "run the daemon",
    },
];

/// Help footer grouping commands by what they touch
pub fn command_summary() -> String {
    let mut lines = vec!["Command scopes:".to_string()];
    for spec in COMMAND_TABLE {
        let scope = match spec.scope {
            Scope::Local => "local",
            Scope::Network => "network",
            Scope::Standalone => "standalone",
        };
        lines.push(format!("  {:<6} {:<10} {}", spec.name, scope, spec.summary));
    }
    lines.join("\n")
}

impl Commands {
    pub fn spec(&self) -> &'static CommandSpec {
        let index = match self {
            Commands::Add { .. } => 0,
            Commands::Get { .. } => 1,
            Commands::Pin { .. } => 2,
            Commands::Cat { .. } => 3,
            Commands::Ls { .. } => 4,
            Commands::Fetch { .. } => 5,
            Commands::Files => 6,
            Commands::Demo { .. } => 7,
            Commands::Start(_) => 8,
        };
        &COMMAND_TABLE[index]
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }
}

/// Run `command`, writing user-facing output to `out`
pub async fn execute<W: Write>(command: Commands, config: Config, out: &mut W) -> Result<(), CommandError> {
    let spec = command.spec();
    debug!("Running {} ({:?})", spec.name, spec.scope);

    match &command {
        Commands::Start(start) => return Ok(run_node(config.with_start(start)).await?),
        Commands::Demo { file } => return run_demo(file, out).await,
        _ => {}
    }

    let store = Blockstore::open(config.blocks_path())?;
    let result = match spec.scope {
        Scope::Network => match Node::start(&config, store.clone(), 0).await {
            Ok(node) => {
                let result = run_network(&command, &node, out).await;
                node.shutdown().await;
                result
            }
            Err(e) => Err(e.into()),
        },
        _ => run_local(&command, &store, out).await,
    };

    let closed = store.close().await;
    result?;
    closed?;
    Ok(())
}

async fn run_local<W: Write>(command: &Commands, store: &Blockstore, out: &mut W) -> Result<(), CommandError> {
    match command {
        Commands::Add { file } => {
            let cid = import_file(file, store).await?;
            writeln!(out, "{}", cid)?;
        }
        Commands::Get { cid, output } => {
            let cid = parse_cid_str(cid)?;
            export_file(&cid, store, output).await?;
            writeln!(out, "Saved {} to {}", cid, output.display())?;
        }
        Commands::Cat { cid } => {
            let cid = parse_cid_str(cid)?;
            out.write_all(&cat(&cid, store).await?)?;
            out.flush()?;
        }
        Commands::Ls { cid } => {
            let cid = parse_cid_str(cid)?;
            let block = store.get(&cid).await?;
            for link in list_links(&block) {
                writeln!(out, "{}\t{}\t{}", link.cid, link.size, link.name)?;
            }
        }
        Commands::Files => {
            for (name, cid) in store.shared_files().await? {
                writeln!(out, "{}\t{}", cid, name)?;
            }
        }
        other => warn!("{} is not a local command", other.name()),
    }
    Ok(())
}

async fn run_network<W: Write>(command: &Commands, node: &Node, out: &mut W) -> Result<(), CommandError> {
    let engine = node.engine();

    match command {
        Commands::Pin { cid } => {
            let cid = parse_cid_str(cid)?;
            if !engine.store().has(&cid).await? {
                return Err(CommandError::NotFound(cid.to_string()));
            }
            if let Err(e) = engine.provide_block(cid).await {
                warn!("Announcement task for {} failed: {}", cid, e);
            }
            writeln!(out, "Pinned {}", cid)?;
        }
        Commands::Fetch { cid, output } => {
            let cid = parse_cid_str(cid)?;
            let block = engine.get_block(&cid).await?;
            let content = node_payload(&block)?;

            match output {
                Some(path) => {
                    tokio::fs::write(path, &content).await?;
                    writeln!(out, "Saved {} ({} bytes) to {}", cid, content.len(), path.display())?;
                }
                None => {
                    out.write_all(&content)?;
                    out.flush()?;
                }
            }
        }
        other => warn!("{} is not a network command", other.name()),
    }
    Ok(())
}

/// Two nodes on localhost: the first imports `file`, the second fetches it
async fn run_demo<W: Write>(file: &Path, out: &mut W) -> Result<(), CommandError> {
    let data = tokio::fs::read(file).await?;
    let config = Config::default();
    let localhost: Multiaddr = "/ip4/127.0.0.1/tcp/0"
        .parse()
        .map_err(|e| CommandError::Demo(format!("listen address: {}", e)))?;

    let seeder_store = Blockstore::in_memory();
    let cid = import_bytes(data.clone(), &seeder_store).await?;
    let seeder = Node::launch(Keypair::generate_ed25519(), localhost.clone(), seeder_store, &config).await?;
    if let Err(e) = seeder.engine().provide_block(cid).await {
        warn!("Announcement task for {} failed: {}", cid, e);
    }
    writeln!(out, "Node A {} imported {} as {}", seeder.peer_id(), file.display(), cid)?;

    let leecher = Node::launch(Keypair::generate_ed25519(), localhost, Blockstore::in_memory(), &config).await?;
    let outcome = demo_fetch(&seeder, &leecher, &cid, &data).await;

    leecher.shutdown().await;
    seeder.shutdown().await;

    let size = outcome?;
    info!("Demo exchange of {} complete", cid);
    writeln!(out, "Node B fetched {} ({} bytes); contents match", cid, size)?;
    Ok(())
}

async fn demo_fetch(seeder: &Node, leecher: &Node, cid: &cid::Cid, expected: &[u8]) -> Result<usize, CommandError> {
    let descriptor = seeder.network().descriptor().await;
    leecher
        .network()
        .connect(&descriptor)
        .await
        .map_err(|e| CommandError::Demo(e.to_string()))?;

    let block = leecher.engine().get_block(cid).await?;
    if block.data != expected {
        return Err(CommandError::Demo("fetched content differs".to_string()));
    }
    Ok(block.size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_table_matches_subcommands() {
        let cli = Cli::command();
        let names: Vec<&str> = cli
            .get_subcommands()
            .map(|c| c.get_name())
            .filter(|name| *name != "help")
            .collect();
        assert_eq!(names.len(), COMMAND_TABLE.len());
        for spec in COMMAND_TABLE {
            assert!(names.contains(&spec.name), "{} missing from clap", spec.name);
        }
    }

    #[test]
    fn test_spec_lookup() {
        let cli = Cli::try_parse_from(["p2pfs", "fetch", "bafy", "--output", "out.bin"]).unwrap();
        assert_eq!(cli.command.name(), "fetch");
        assert_eq!(cli.command.spec().scope, Scope::Network);

        let cli = Cli::try_parse_from(["p2pfs", "--data-dir", "/tmp/x", "files"]).unwrap();
        assert_eq!(cli.command.spec().scope, Scope::Local);
        assert_eq!(cli.global.data_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[tokio::test]
    async fn test_add_cat_ls_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("hello.txt");
        std::fs::write(&input, b"hello e2e").unwrap();
        let config = test_config(&dir.path().join("node"));

        let mut out = Vec::new();
        execute(Commands::Add { file: input }, config.clone(), &mut out)
            .await
            .unwrap();
        let cid = String::from_utf8(out).unwrap().trim().to_string();

        let mut out = Vec::new();
        execute(Commands::Cat { cid: cid.clone() }, config.clone(), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello e2e");

        let mut out = Vec::new();
        execute(Commands::Ls { cid: cid.clone() }, config.clone(), &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());

        let mut out = Vec::new();
        execute(Commands::Files, config, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), format!("{}\thello.txt\n", cid));
    }

    #[tokio::test]
    async fn test_invalid_and_missing_cids() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut out = Vec::new();

        let err = execute(Commands::Cat { cid: "nope".to_string() }, config.clone(), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidIdentifier(_)));

        let missing = crate::content_id::block_cid(b"missing").unwrap().to_string();
        let err = execute(Commands::Cat { cid: missing }, config, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bin");
        let output = dir.path().join("out.bin");
        std::fs::write(&input, b"exported").unwrap();
        let config = test_config(&dir.path().join("node"));

        let mut out = Vec::new();
        execute(Commands::Add { file: input }, config.clone(), &mut out)
            .await
            .unwrap();
        let cid = String::from_utf8(out).unwrap().trim().to_string();

        let mut out = Vec::new();
        execute(
            Commands::Get {
                cid,
                output: output.clone(),
            },
            config,
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"exported");
    }

    #[tokio::test]
    async fn test_demo_exchanges_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("demo.txt");
        std::fs::write(&input, b"demo payload").unwrap();

        let mut out = Vec::new();
        run_demo(&input, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("contents match"));
    }
}
