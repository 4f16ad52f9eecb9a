use clap::{Parser, Subcommand};
use colored::*;
use eyre::Result;
use std::path::PathBuf;

use understore::Store;

#[derive(Parser, Debug)]
#[command(name = "understore")]
#[command(version, about = "Inspect an understore database", long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, default_value = ".undercity/undercity.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List collections in the database
    Collections,

    /// Dump records from a collection as JSON lines
    Dump {
        /// Collection name
        #[arg(required = true)]
        collection: String,

        /// Only print record IDs
        #[arg(long)]
        ids: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut store = Store::open(&cli.db)?;

    match cli.command {
        Command::Collections => {
            for name in store.collections()? {
                println!("{}", name.cyan());
            }
        }
        Command::Dump { collection, ids } => {
            for (id, payload) in store.dump(&collection)? {
                if ids {
                    println!("{}", id);
                } else {
                    println!("{}", payload);
                }
            }
        }
    }

    Ok(())
}
