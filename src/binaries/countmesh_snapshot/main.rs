//! countmesh-snapshot: offline inspector for a durable sketch snapshot.
//!
//! Prints the record header, the flush version and the estimate without
//! touching any running node. Handy when deciding whether a snapshot from
//! a degraded node is worth keeping.

use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;

use countmesh_node::durability::{FileSnapshotStore, SnapshotStore};
use countmesh_sketch::{decode, digest, estimate};

#[derive(Debug, Parser)]
#[clap(name = "countmesh-snapshot", about = "Inspect a sketch snapshot file", version)]
struct Config {
    /// Snapshot file written by a countmeshd node.
    #[clap(long)]
    path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let store = FileSnapshotStore::new(&config.path, true);
    let record = store
        .load_latest()
        .await?
        .ok_or_else(|| anyhow!("no snapshot at {}", config.path.display()))?;
    let sketch = decode(&record.sketch)?;

    println!("file:      {}", config.path.display());
    println!("version:   {}", record.version);
    println!("precision: {} ({} registers)", sketch.precision(), sketch.m());
    println!("nonzero:   {}", sketch.nonzero());
    println!("digest:    {:#018x}", digest(&sketch));
    println!("estimate:  {:.1}", estimate(&sketch));

    Ok(())
}
