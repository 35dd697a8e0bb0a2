use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{load_opts, load_psbt};
use utxo_psbt::bitcoin::consensus::encode::serialize_hex;

pub fn handle_extract_command(
    path: PathBuf,
    disable_fee_check: bool,
    max_fee_rate: Option<u64>,
    options: Option<PathBuf>,
) -> Result<()> {
    let mut opts = load_opts(options.as_deref())?;
    if let Some(rate) = max_fee_rate {
        opts.maximum_fee_rate = rate;
    }
    let psbt = load_psbt(&path, opts)?;
    let tx = psbt
        .extract_transaction(disable_fee_check)
        .context("Failed to extract transaction")?;

    log::info!("extracted {} ({} vbytes)", tx.compute_txid(), tx.vsize());
    println!("{}", serialize_hex(&tx));
    Ok(())
}
