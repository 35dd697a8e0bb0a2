use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{load_psbt, print_psbt, OutputFormat};
use utxo_psbt::PsbtOpts;

pub fn handle_combine_command(paths: Vec<PathBuf>, format: OutputFormat) -> Result<()> {
    let mut documents = paths
        .iter()
        .map(|path| load_psbt(path, PsbtOpts::default()))
        .collect::<Result<Vec<_>>>()?;
    let mut base = documents.remove(0);
    base.combine(&documents).context("Failed to combine PSBTs")?;

    log::info!("combined {} PSBTs", paths.len());
    print_psbt(&base, format);
    Ok(())
}
