use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use super::load_psbt;
use utxo_psbt::{Psbt, PsbtOpts};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FeeReport {
    pub fee: u64,
    /// Only known once every input is finalized.
    pub fee_rate: Option<u64>,
}

pub fn fee_report(psbt: &Psbt) -> Result<FeeReport> {
    let fee = psbt.fee().context("Failed to compute fee")?.to_sat();
    let fee_rate = if psbt.is_finalized() {
        Some(psbt.fee_rate().context("Failed to compute fee rate")?)
    } else {
        None
    };
    Ok(FeeReport { fee, fee_rate })
}

pub fn handle_fee_command(path: PathBuf) -> Result<()> {
    let psbt = load_psbt(&path, PsbtOpts::default())?;
    println!("{}", serde_json::to_string_pretty(&fee_report(&psbt)?)?);
    Ok(())
}
