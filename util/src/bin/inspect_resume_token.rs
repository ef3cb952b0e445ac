//! Decodes a resume token issued by `tunnox_core::resume::ResumeManager`
//! (spec §4.10) and prints its claims, given the same `resume_secret` the
//! issuing node was configured with. An operator reaches for this to
//! confirm a token a client reports as rejected really has expired rather
//! than being a transport/copy-paste corruption.

use clap::Parser;
use tunnox_core::resume::decode_token;

#[derive(Parser, Debug)]
#[command(name = "inspect-resume-token", about = "Decodes and verifies a Tunnox resume token")]
struct Cli {
    /// The opaque token string as presented by the client.
    token: String,

    /// The node's `resume_secret`, same encoding as in `tunnox-node.toml`.
    #[arg(long)]
    secret: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match decode_token(&cli.token, cli.secret.as_bytes()) {
        Ok(claims) => {
            println!("tunnel_id:  {}", claims.tunnel_id);
            println!("issued_at:  {}", claims.issued_at);
            println!("expires_at: {}", claims.expires_at);
        }
        Err(err) => {
            eprintln!("token rejected: {err}");
            std::process::exit(1);
        }
    }

    Ok(())
}
