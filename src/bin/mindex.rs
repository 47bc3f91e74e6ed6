use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use mindex::{Config, MergeIndex};

/// Maintenance tool for a merge-index store directory.
#[derive(Parser)]
#[clap(author, version, about)]
#[clap(propagate_version = true)]
struct Args {
    /// Store root directory
    #[clap(value_parser)]
    root: PathBuf,
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the selectivity estimate for one term
    Info {
        /// Index name
        #[clap(value_parser)]
        index: String,
        /// Field name
        #[clap(value_parser)]
        field: String,
        /// Term
        #[clap(value_parser)]
        term: String,
    },
    /// Dump every posting, including duplicates and tombstones
    Scan,
    /// Trigger a compaction run and report what it merged
    Compact,
    /// Check whether the store holds any data
    IsEmpty,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).init();

    let args = Args::parse();
    let store = MergeIndex::open(&args.root, Config::default())?;

    match args.command {
        Cmd::Info { index, field, term } => {
            let weight = store.info(index.as_bytes(), field.as_bytes(), term.as_bytes())?;
            println!("{}", weight);
        }
        Cmd::Scan => {
            let total = store.fold(0u64, |total, posting| {
                let props = match &posting.props {
                    Some(props) => String::from_utf8_lossy(props).into_owned(),
                    None => "<tombstone>".to_owned(),
                };
                println!(
                    "{}/{}/{} {} ts={} {}",
                    String::from_utf8_lossy(&posting.index),
                    String::from_utf8_lossy(&posting.field),
                    String::from_utf8_lossy(&posting.term),
                    String::from_utf8_lossy(&posting.value),
                    posting.timestamp,
                    props,
                );
                total + 1
            })?;
            println!("{} postings", total);
        }
        Cmd::Compact => {
            let (merged, bytes) = store.compact()?;
            println!("merged {} segments ({} bytes)", merged, bytes);
        }
        Cmd::IsEmpty => {
            println!("{}", store.is_empty()?);
        }
    }
    Ok(())
}
