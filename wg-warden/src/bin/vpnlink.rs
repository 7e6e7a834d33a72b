//! vpnlink - Convert client configs to and from shareable `vpn://` links
//!
//! Usage:
//!   vpnlink encode client.conf             - Print the link for a config file
//!   vpnlink encode client.conf -o link.txt - Write it to a file instead
//!   vpnlink decode 'vpn://AAAB...'         - Print the config a link carries

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use wg_warden::codec;

#[derive(Parser)]
#[command(name = "vpnlink")]
#[command(about = "Encode and decode vpn:// config links", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a config file into a link
    Encode {
        /// Config file to encode
        input: PathBuf,
        /// Write the link here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep Endpoint hostnames instead of resolving them to addresses
        #[arg(long)]
        keep_hostnames: bool,
    },
    /// Decode a link back into a config
    Decode {
        /// The link, with or without the vpn:// prefix
        link: String,
        /// Write the config here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn emit(contents: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))?;
            log::info!("Wrote {:?}", path);
        }
        None => print!("{}", contents),
    }
    Ok(())
}

fn encode_file(input: &Path, keep_hostnames: bool) -> Result<String> {
    let text = fs::read_to_string(input).with_context(|| format!("Failed to read {:?}", input))?;

    let text = if keep_hostnames {
        text
    } else {
        codec::resolve_endpoints(&text, codec::system_resolver)?
    };

    Ok(codec::encode(&text)?)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            input,
            output,
            keep_hostnames,
        } => {
            let link = encode_file(&input, keep_hostnames)?;
            emit(&format!("{}\n", link), output.as_deref())
        }
        Commands::Decode { link, output } => {
            let text = codec::decode(&link).context("Failed to decode link")?;
            emit(&text, output.as_deref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        let text = "[Interface]\nAddress = 10.8.0.2/32\n\n[Peer]\nEndpoint = vpn.example.com:51820\n";
        fs::write(&path, text).unwrap();

        let link = encode_file(&path, true).unwrap();
        assert_eq!(codec::decode(&link).unwrap(), text);
    }

    #[test]
    fn test_encode_resolves_literal_endpoints_without_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.conf");
        let text = "[Peer]\nEndpoint = 203.0.113.7:51820\n";
        fs::write(&path, text).unwrap();

        let link = encode_file(&path, false).unwrap();
        assert_eq!(codec::decode(&link).unwrap(), text);
    }

    #[test]
    fn test_missing_input_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(encode_file(&dir.path().join("absent.conf"), true).is_err());
    }

    #[test]
    fn test_emit_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.conf");
        emit("[Peer]\n", Some(&path)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Peer]\n");
    }
}
