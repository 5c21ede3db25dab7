//! Embeds the distribution bundle into the binary.
//!
//! The bundle comes from `RKD_BUNDLE`, or `build/bundle.tar.gz` at the
//! workspace root. It is named after its SHA-256 so every distinct payload
//! stages into its own version directory.

use std::env;
use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

fn main() {
    println!("cargo:rerun-if-env-changed=RKD_BUNDLE");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let default_bundle = manifest_dir.join("../../build/bundle.tar.gz");
    println!("cargo:rerun-if-changed={}", default_bundle.display());

    let bundle = env::var_os("RKD_BUNDLE")
        .map(PathBuf::from)
        .or_else(|| default_bundle.exists().then_some(default_bundle));

    let entries = match bundle {
        Some(path) => {
            println!("cargo:rerun-if-changed={}", path.display());
            let bytes = fs::read(&path)
                .unwrap_or_else(|e| panic!("failed to read bundle {}: {e}", path.display()));
            let path = fs::canonicalize(&path).expect("canonical bundle path");
            let name = format!("{}.tar.gz", hex::encode(Sha256::digest(&bytes)));
            format!(
                "&[({name:?}, include_bytes!({:?}) as &[u8])]",
                path.display().to_string()
            )
        }
        None => "&[]".to_string(),
    };

    let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR")).join("assets.rs");
    fs::write(
        out,
        format!("pub static EMBEDDED: &[(&str, &[u8])] = {entries};\n"),
    )
    .expect("failed to write assets.rs");
}
