//! Command-line surface for the mesh node binary.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(about = "Runs a single mesh-core coordinator against mock transport/storage")]
#[command(version)]
pub struct Cli {
    /// Region label advertised to peers and used for selector/score locality boosts.
    #[arg(short, long, env = "MESH_REGION")]
    pub region: Option<String>,

    /// Starting balance credited to this node's own DID in the in-memory ledger.
    #[arg(long, default_value_t = 10_000)]
    pub initial_balance: i64,

    /// How long to run before shutting down, in seconds. Omit to run until Ctrl-C.
    #[arg(long)]
    pub run_seconds: Option<u64>,

    /// Tracing filter, e.g. "info" or "mesh_core=debug,mesh_node=trace".
    #[arg(long, default_value = "info", env = "MESH_LOG")]
    pub log_filter: String,
}
