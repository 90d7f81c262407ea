//! Administrative tool for stripefs storage spaces: create and delete
//! storage, list directories and watch per-server performance counters.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use stripefs::{Engine, FsId, Handle, StorageConfig};

#[derive(Parser)]
#[command(name = "stripefs-admin", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Storage-root selectors shared by every subcommand.
#[derive(Args)]
struct Spaces {
    /// Root directory for bstream files.
    #[arg(long)]
    data_space: PathBuf,
    /// Root directory for keyval stores and collection metadata.
    #[arg(long)]
    meta_space: PathBuf,
    /// Root directory for server config and the SID snapshot.
    #[arg(long)]
    config_space: PathBuf,
}

impl Spaces {
    fn to_config(&self) -> StorageConfig {
        StorageConfig::with_roots(&self.data_space, &self.meta_space, &self.config_space)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a storage space, or add a collection to an existing one.
    Mkspace {
        #[command(flatten)]
        spaces: Spaces,
        /// Name of the collection to create.
        #[arg(long)]
        coll_name: String,
        /// Numeric fs_id of the collection.
        #[arg(long)]
        coll_id: u32,
        /// Root handle for the collection, decimal or 0x-prefixed hex.
        #[arg(long, value_parser = parse_handle)]
        root_handle: Option<Handle>,
        /// Add a collection to an already-created storage space.
        #[arg(long)]
        add_coll: bool,
    },
    /// Delete a collection, or the whole storage space.
    Rmspace {
        #[command(flatten)]
        spaces: Spaces,
        /// Collection to delete.
        #[arg(long)]
        coll_name: Option<String>,
        /// Delete the storage roots themselves.
        #[arg(long)]
        delete_storage: bool,
    },
    /// List a directory dataspace.
    Ls {
        #[command(flatten)]
        spaces: Spaces,
        /// Collection to look in.
        #[arg(long)]
        coll_name: String,
        /// Path from the collection root.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Poll the per-server performance counters.
    Perfmon {
        #[command(flatten)]
        spaces: Spaces,
        /// Sampling interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Number of polls before exiting; 0 polls forever.
        #[arg(long, default_value_t = 5)]
        count: u64,
    },
}

fn parse_handle(text: &str) -> Result<Handle, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16),
        None => text.parse::<u128>(),
    };
    parsed
        .map(Handle)
        .map_err(|e| format!("bad handle {text:?}: {e}"))
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("stripefs-admin: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Mkspace {
            spaces,
            coll_name,
            coll_id,
            root_handle,
            add_coll,
        } => {
            let config = spaces.to_config();
            Engine::mkspace(&config, &coll_name, FsId(coll_id), root_handle, add_coll)
                .with_context(|| format!("creating collection {coll_name}"))?;
            println!("collection {coll_name} created with fs_id {coll_id}");
            Ok(())
        }
        Command::Rmspace {
            spaces,
            coll_name,
            delete_storage,
        } => {
            if coll_name.is_none() && !delete_storage {
                bail!("nothing to do: pass --coll-name and/or --delete-storage");
            }
            let config = spaces.to_config();
            Engine::rmspace(&config, coll_name.as_deref(), delete_storage)
                .context("removing storage")?;
            Ok(())
        }
        Command::Ls {
            spaces,
            coll_name,
            path,
        } => {
            let engine = Engine::open(spaces.to_config()).context("opening storage")?;
            let fs_id = engine.trove().registry().lookup(&coll_name)?;
            let dir = engine.path_lookup(fs_id, &path)?;
            for entry in engine.list_directory(fs_id, dir)? {
                match entry.handle {
                    Some(handle) => println!("{handle}  {}", entry.name),
                    None => println!("{:32}  {}", "-", entry.name),
                }
            }
            Ok(())
        }
        Command::Perfmon {
            spaces,
            interval_ms,
            count,
        } => {
            let engine = Engine::open(spaces.to_config()).context("opening storage")?;
            println!(
                "{:>6} {:>14} {:>12} {:>12} {:>10} {:>10} {:>6}",
                "id", "start_ms", "read_B", "write_B", "md_read", "md_write", "valid"
            );
            let mut polls = 0u64;
            loop {
                for sample in engine.perf_snapshot() {
                    println!(
                        "{:>6} {:>14} {:>12} {:>12} {:>10} {:>10} {:>6}",
                        sample.id,
                        sample.start_time_ms,
                        sample.read_bytes,
                        sample.write_bytes,
                        sample.md_read_count,
                        sample.md_write_count,
                        sample.valid
                    );
                }
                polls += 1;
                if count != 0 && polls >= count {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(interval_ms));
            }
        }
    }
}
