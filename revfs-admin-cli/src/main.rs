//! revfs repository administration tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revfs_core::{FileSystem, NodeKind, NodeRevision};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "revfs-admin")]
#[command(version = "0.1.0")]
#[command(about = "Administration tool for revfs repositories")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty repository
    Create { path: PathBuf },

    /// Display repository information
    Info { repo: PathBuf },

    /// Print the youngest revision number
    Youngest { repo: PathBuf },

    /// List a directory at a revision
    Ls {
        repo: PathBuf,
        path: String,
        #[arg(short = 'r', long)]
        revision: Option<u64>,
    },

    /// Print the contents of a file at a revision
    Cat {
        repo: PathBuf,
        path: String,
        #[arg(short = 'r', long)]
        revision: Option<u64>,
    },

    /// List changed paths of a revision
    Changed {
        repo: PathBuf,
        #[arg(short = 'r', long)]
        revision: u64,
    },

    /// Show a file's change between two revisions as a unified diff
    Diff {
        repo: PathBuf,
        path: String,
        /// Base revision (defaults to the revision before --revision)
        #[arg(long)]
        from: Option<u64>,
        /// Target revision (defaults to the youngest)
        #[arg(short = 'r', long)]
        revision: Option<u64>,
        /// Extra diff options (-b, -w, --ignore-eol-style, -p)
        #[arg(short = 'x', long = "extensions")]
        extensions: Vec<String>,
    },

    /// List in-flight transactions
    #[command(name = "lstxns")]
    LsTxns { repo: PathBuf },

    /// Remove named transactions
    #[command(name = "rmtxns")]
    RmTxns {
        repo: PathBuf,
        txn_names: Vec<String>,
    },

    /// Set the repository UUID (generates one when omitted)
    #[command(name = "setuuid")]
    SetUuid {
        repo: PathBuf,
        uuid: Option<String>,
    },

    /// Hot-copy a repository to a new location
    #[command(name = "hotcopy")]
    HotCopy { src: PathBuf, dst: PathBuf },

    /// Verify that every revision is readable
    Verify {
        repo: PathBuf,
        #[arg(short, long)]
        quiet: bool,
    },
}

/// Walk PATH from the root of REV down to its node-revision.
fn lookup(fs: &FileSystem, rev: u64, path: &str) -> Result<NodeRevision> {
    let root_id = fs.rev_get_root(rev)?;
    let mut noderev = fs.get_node_revision(&root_id)?;

    for part in path.split('/').filter(|p| !p.is_empty()) {
        let entries = fs.rep_contents_dir(&noderev)?;
        let entry = entries
            .get(part)
            .with_context(|| format!("path '{}' not found in r{}", path, rev))?;
        noderev = fs.get_node_revision(&entry.id)?;
    }
    Ok(noderev)
}

fn resolve_rev(fs: &FileSystem, revision: Option<u64>) -> Result<u64> {
    match revision {
        Some(rev) => Ok(rev),
        None => Ok(fs.youngest_rev()?),
    }
}

/// Read every revision's root tree and changed paths, recursing into
/// directories and checksumming file contents as we go.
fn verify_tree(fs: &FileSystem, noderev: &NodeRevision) -> Result<()> {
    match noderev.kind {
        NodeKind::File => {
            // Reading the full contents verifies the stored MD5.
            fs.file_contents(noderev)?;
        }
        NodeKind::Dir => {
            for entry in fs.rep_contents_dir(noderev)?.values() {
                let child = fs.get_node_revision(&entry.id)?;
                verify_tree(fs, &child)?;
            }
        }
    }
    fs.get_proplist(noderev)?;
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Create { path } => {
            let fs = FileSystem::create(&path)
                .with_context(|| format!("failed to create repository at {}", path.display()))?;
            println!("Created repository at {} ({})", path.display(), fs.uuid());
        }
        Commands::Info { repo } => {
            let fs = FileSystem::open(&repo)?;
            println!("Path: {}", repo.display());
            println!("UUID: {}", fs.uuid());
            println!("Youngest revision: {}", fs.youngest_rev()?);
            let txns = fs.list_transactions()?;
            println!("Open transactions: {}", txns.len());
        }
        Commands::Youngest { repo } => {
            let fs = FileSystem::open(&repo)?;
            println!("{}", fs.youngest_rev()?);
        }
        Commands::Ls { repo, path, revision } => {
            let fs = FileSystem::open(&repo)?;
            let rev = resolve_rev(&fs, revision)?;
            let noderev = lookup(&fs, rev, &path)?;
            for entry in fs.rep_contents_dir(&noderev)?.values() {
                let suffix = if entry.kind == NodeKind::Dir { "/" } else { "" };
                println!("{}{}", entry.name, suffix);
            }
        }
        Commands::Cat { repo, path, revision } => {
            let fs = FileSystem::open(&repo)?;
            let rev = resolve_rev(&fs, revision)?;
            let noderev = lookup(&fs, rev, &path)?;
            let contents = fs.file_contents(&noderev)?;
            std::io::stdout().write_all(&contents)?;
        }
        Commands::Changed { repo, revision } => {
            let fs = FileSystem::open(&repo)?;
            for (path, change) in fs.paths_changed(revision)? {
                println!("{:?} {}", change.kind, path);
            }
        }
        Commands::Diff {
            repo,
            path,
            from,
            revision,
            extensions,
        } => {
            let fs = FileSystem::open(&repo)?;
            let to = resolve_rev(&fs, revision)?;
            let from = from.unwrap_or_else(|| to.saturating_sub(1));

            // The diff engine works on real files; stage both versions.
            let old = tempfile::NamedTempFile::new()?;
            let new = tempfile::NamedTempFile::new()?;
            std::fs::write(old.path(), fs.file_contents(&lookup(&fs, from, &path)?)?)?;
            std::fs::write(new.path(), fs.file_contents(&lookup(&fs, to, &path)?)?)?;

            let options = revfs_diff::DiffOptions::parse(&extensions)?;
            let diff = revfs_diff::diff_files(old.path(), new.path(), &options)?;
            let mut stdout = std::io::stdout();
            revfs_diff::write_unified(
                &mut stdout,
                &diff,
                old.path(),
                new.path(),
                Some(&format!("{} (revision {})", path, from)),
                Some(&format!("{} (revision {})", path, to)),
                options.show_c_function,
            )?;
        }
        Commands::LsTxns { repo } => {
            let fs = FileSystem::open(&repo)?;
            for name in fs.list_transactions()? {
                println!("{}", name);
            }
        }
        Commands::RmTxns { repo, txn_names } => {
            let fs = FileSystem::open(&repo)?;
            for name in txn_names {
                fs.purge_txn(&name)
                    .with_context(|| format!("failed to remove transaction '{}'", name))?;
                println!("Transaction '{}' removed.", name);
            }
        }
        Commands::SetUuid { repo, uuid } => {
            let mut fs = FileSystem::open(&repo)?;
            let uuid = fs.set_uuid(uuid)?;
            println!("UUID set to {}", uuid);
        }
        Commands::HotCopy { src, dst } => {
            FileSystem::hotcopy(&src, &dst)
                .with_context(|| format!("hotcopy to {} failed", dst.display()))?;
            println!("Hotcopied {} to {}", src.display(), dst.display());
        }
        Commands::Verify { repo, quiet } => {
            let fs = FileSystem::open(&repo)?;
            let youngest = fs.youngest_rev()?;
            for rev in 0..=youngest {
                let root = fs.get_node_revision(&fs.rev_get_root(rev)?)?;
                verify_tree(&fs, &root)?;
                fs.paths_changed(rev)?;
                fs.revision_proplist(rev)?;
                if !quiet {
                    println!("* Verified revision {}.", rev);
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(cli)
}
