use std::env;
use std::fs;
use std::path::Path;

const CONFIG_NAME: &str = "tunnox-node.toml";

/// Copies the packaged default config next to the built binary, the same
/// way the teacher's `build.rs` staged `rocket.toml` for its service
/// binary — so `cargo run` works out of the box without an operator having
/// to hand-place a config file first.
fn main() {
    let source_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let out_dir = env::var("OUT_DIR").unwrap();

    let source_path = Path::new(&source_dir).join("config").join(CONFIG_NAME);
    let out_path = Path::new(&out_dir)
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.parent())
        .expect("failed navigating OUT_DIR up to the target directory")
        .join(CONFIG_NAME);

    fs::copy(&source_path, &out_path).unwrap_or_else(|e| panic!("failed to copy {} to {}: {e}", source_path.display(), out_path.display()));
    println!("cargo:rerun-if-changed={}", source_path.display());
}
