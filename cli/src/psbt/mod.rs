use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use crate::input::{decode_input, read_input_bytes};
use crate::network::NetworkArg;
use utxo_psbt::{Psbt, PsbtOpts};

mod combine;
mod extract;
mod fee;
mod finalize;
mod parse;

/// Encoding for PSBTs written to stdout
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Base64,
    Hex,
}

#[derive(Subcommand)]
pub enum PsbtCommand {
    /// Parse a PSBT file and display its contents
    Parse {
        /// Path to the PSBT file (use '-' to read from stdin)
        path: PathBuf,
        /// Network for address formatting
        #[arg(long, short, value_enum, default_value_t)]
        network: NetworkArg,
        /// Disable colored output
        #[arg(long)]
        no_color: bool,
        /// Print the summary as JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
    /// Merge PSBTs for the same transaction
    Combine {
        /// PSBT files to merge, the first one is the base
        #[arg(num_args = 2.., required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Finalize every input that has enough signatures
    Finalize {
        /// Path to the PSBT file (use '-' to read from stdin)
        path: PathBuf,
        /// Finalize multisig inputs below threshold with empty placeholders
        #[arg(long)]
        allow_incomplete: bool,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Extract the network transaction from a finalized PSBT as hex
    Extract {
        /// Path to the PSBT file (use '-' to read from stdin)
        path: PathBuf,
        /// Skip the maximum fee rate check
        #[arg(long)]
        disable_fee_check: bool,
        /// Maximum fee rate in sat/vB
        #[arg(long)]
        max_fee_rate: Option<u64>,
        /// JSON file with PSBT options
        #[arg(long)]
        options: Option<PathBuf>,
    },
    /// Print the fee and, once finalized, the fee rate
    Fee {
        /// Path to the PSBT file (use '-' to read from stdin)
        path: PathBuf,
    },
}

pub fn handle_command(command: PsbtCommand) -> Result<()> {
    match command {
        PsbtCommand::Parse {
            path,
            network,
            no_color,
            json,
        } => parse::handle_parse_command(path, network.into(), no_color, json),
        PsbtCommand::Combine { paths, format } => combine::handle_combine_command(paths, format),
        PsbtCommand::Finalize {
            path,
            allow_incomplete,
            format,
        } => finalize::handle_finalize_command(path, allow_incomplete, format),
        PsbtCommand::Extract {
            path,
            disable_fee_check,
            max_fee_rate,
            options,
        } => extract::handle_extract_command(path, disable_fee_check, max_fee_rate, options),
        PsbtCommand::Fee { path } => fee::handle_fee_command(path),
    }
}

pub(crate) fn load_psbt(path: &Path, opts: PsbtOpts) -> Result<Psbt> {
    let raw_bytes = read_input_bytes(path, "PSBT")?;
    let bytes = decode_input(&raw_bytes)?;
    Psbt::from_bytes(&bytes, opts).with_context(|| format!("Failed to parse PSBT {}", path.display()))
}

pub(crate) fn load_opts(path: Option<&Path>) -> Result<PsbtOpts> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read options file {}", path.display()))?;
            serde_json::from_str(&text).context("Invalid PSBT options")
        }
        None => Ok(PsbtOpts::default()),
    }
}

pub(crate) fn print_psbt(psbt: &Psbt, format: OutputFormat) {
    match format {
        OutputFormat::Base64 => println!("{}", psbt.to_base64()),
        OutputFormat::Hex => println!("{}", psbt.to_hex()),
    }
}
