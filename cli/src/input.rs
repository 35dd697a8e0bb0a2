//! Reading command input from files or stdin.

use anyhow::{Context, Result};
use base64::Engine;
use std::io::Read;
use std::path::Path;

const PSBT_MAGIC: &[u8] = b"psbt\xff";
const BASE64_MAGIC: &str = "cHNidP";
const HEX_MAGIC: &str = "70736274ff";

/// Read a file, or stdin when `path` is `-`.
pub fn read_input_bytes(path: &Path, label: &str) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .with_context(|| format!("Failed to read {} from stdin", label))?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("Failed to read {} file {}", label, path.display()))
}

/// Accept raw PSBT bytes, hex or base64.
pub fn decode_input(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.starts_with(PSBT_MAGIC) {
        return Ok(raw.to_vec());
    }
    let text = std::str::from_utf8(raw)
        .context("Input is neither a binary PSBT nor text")?
        .trim();
    let base64 = base64::engine::general_purpose::STANDARD;
    if text.starts_with(BASE64_MAGIC) {
        return base64.decode(text).context("Input is not valid base64");
    }
    if text.get(..HEX_MAGIC.len()).is_some_and(|prefix| prefix.eq_ignore_ascii_case(HEX_MAGIC)) {
        return hex::decode(text).context("Input is not valid hex");
    }
    // no recognizable PSBT prefix, let the parser report what is wrong
    if let Ok(bytes) = hex::decode(text) {
        return Ok(bytes);
    }
    base64.decode(text).context("Input is not valid hex or base64")
}
