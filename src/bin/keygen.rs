//! ML-DSA-65 identity generator for custody nodes and downloaders.
//!
//! Generates a key pair and writes `node.key` (secret, keep private) and
//! `node.pub` into the output directory, then prints the ledger address.
//!
//! Usage:
//!   cargo run --bin custody-keygen [output-dir]

use custody_node::identity::{KeyPair, PUBLIC_KEY_FILE, SECRET_KEY_FILE};
use std::env;
use std::path::PathBuf;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    println!("ML-DSA-65 identity generator for custody-node\n");

    // Get output directory from args or use current directory
    let output_dir = match env::args().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => env::current_dir()?,
    };

    let secret_path = output_dir.join(SECRET_KEY_FILE);
    if secret_path.exists() {
        color_eyre::eyre::bail!(
            "{} already exists; refusing to overwrite an identity",
            secret_path.display()
        );
    }

    println!("Generating ML-DSA-65 keypair...");
    let key = KeyPair::generate()?;
    let saved = key.save(&output_dir)?;

    println!("  Public key size: {} bytes", key.public_key_bytes().len());
    println!("\nSecret key saved to: {}", saved.display());
    println!("  WARNING: Keep this file secure! It signs vouchers and proofs.");
    println!(
        "Public key saved to: {}",
        output_dir.join(PUBLIC_KEY_FILE).display()
    );
    println!("\nAddress: {}", key.address());
    Ok(())
}
