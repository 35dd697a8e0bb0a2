use anyhow::{bail, Result};
use std::path::PathBuf;

use super::{load_psbt, print_psbt, OutputFormat};
use utxo_psbt::psbt::FinalizeOptions;
use utxo_psbt::PsbtOpts;

pub fn handle_finalize_command(path: PathBuf, allow_incomplete: bool, format: OutputFormat) -> Result<()> {
    let mut psbt = load_psbt(&path, PsbtOpts::default())?;
    let options = FinalizeOptions {
        allow_incomplete,
        leaf_hash: None,
    };

    let mut failures = 0;
    for index in 0..psbt.input_count() {
        if psbt.is_input_finalized(index)? {
            continue;
        }
        if let Err(e) = psbt.finalize_input_with_options(index, &options) {
            log::error!("input {}: {}", index, e);
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{} of {} inputs could not be finalized", failures, psbt.input_count());
    }

    print_psbt(&psbt, format);
    Ok(())
}
