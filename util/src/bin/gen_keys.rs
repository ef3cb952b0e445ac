//! Generates fresh client ids and secrets for the in-memory cloud-control
//! roster (`tunnox-node.toml`'s `[[clients.entries]]` table) — the same job
//! the teacher's `gen_keys` binary did for its JSON client file, rewritten
//! against `tunnox_common::crypto` instead of a hand-rolled alphabet.

use std::io::Write;

use clap::Parser;
use rand::Rng;
use tunnox_common::crypto::random_secret;
use tunnox_common::encoding;

#[derive(Parser, Debug)]
#[command(name = "gen-keys", about = "Generates client id/secret pairs for a tunnox-node roster")]
struct Cli {
    /// Number of client entries to generate.
    #[arg(default_value_t = 1)]
    count: usize,

    /// Emit `[[clients.entries]]` TOML blocks instead of plain `id\tsecret` lines.
    #[arg(long)]
    toml: bool,
}

/// The client-facing id stays an 8-digit integer (spec Design Notes §9),
/// drawn uniformly with no collision bookkeeping here — the roster file is
/// the authority on what's taken, and a single generator run has no
/// visibility into it.
fn random_client_id() -> i64 {
    rand::thread_rng().gen_range(10_000_000..100_000_000)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for _ in 0..cli.count {
        let id = random_client_id();
        let secret = encoding::encode(&random_secret());

        if cli.toml {
            writeln!(out, "[[clients.entries]]")?;
            writeln!(out, "id = {id}")?;
            writeln!(out, "secret = \"{secret}\"")?;
            writeln!(out)?;
        } else {
            writeln!(out, "{id}\t{secret}")?;
        }
    }

    Ok(())
}
