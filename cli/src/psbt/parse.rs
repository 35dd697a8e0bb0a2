use anyhow::Result;
use ptree::TreeBuilder;
use serde::Serialize;
use std::path::PathBuf;

use super::load_psbt;
use crate::format::{render_tree, ColorScheme};
use utxo_psbt::bitcoin::{Address, Network};
use utxo_psbt::payments::classify;
use utxo_psbt::{Psbt, PsbtOpts};

#[derive(Debug, Serialize)]
pub struct InputSummary {
    pub index: usize,
    pub previous_output: String,
    pub sequence: u32,
    pub input_type: Option<String>,
    pub value: Option<u64>,
    pub partial_sigs: usize,
    pub tap_key_sig: bool,
    pub tap_script_sigs: usize,
    pub finalized: bool,
}

#[derive(Debug, Serialize)]
pub struct OutputSummary {
    pub index: usize,
    pub value: u64,
    pub script_type: String,
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PsbtSummary {
    pub txid: String,
    pub version: i32,
    pub locktime: u32,
    pub inputs: Vec<InputSummary>,
    pub outputs: Vec<OutputSummary>,
    pub fee: Option<u64>,
    pub finalized: bool,
}

pub fn summarize(psbt: &Psbt, network: Network) -> PsbtSummary {
    let tx = psbt.unsigned_tx();
    let inputs = psbt
        .inner()
        .inputs
        .iter()
        .zip(&tx.input)
        .enumerate()
        .map(|(index, (input, txin))| InputSummary {
            index,
            previous_output: txin.previous_output.to_string(),
            sequence: txin.sequence.to_consensus_u32(),
            input_type: psbt.get_input_type(index).ok().map(|t| t.to_string()),
            value: psbt.cache().prevout(psbt.inner(), index).ok().map(|o| o.value.to_sat()),
            partial_sigs: input.partial_sigs.len(),
            tap_key_sig: input.tap_key_sig.is_some(),
            tap_script_sigs: input.tap_script_sigs.len(),
            finalized: psbt.is_input_finalized(index).unwrap_or(false),
        })
        .collect();
    let outputs = tx
        .output
        .iter()
        .enumerate()
        .map(|(index, output)| OutputSummary {
            index,
            value: output.value.to_sat(),
            script_type: classify(&output.script_pubkey).to_string(),
            address: Address::from_script(&output.script_pubkey, network)
                .ok()
                .map(|a| a.to_string()),
        })
        .collect();

    PsbtSummary {
        txid: tx.compute_txid().to_string(),
        version: tx.version.0,
        locktime: tx.lock_time.to_consensus_u32(),
        inputs,
        outputs,
        fee: psbt.fee().ok().map(|f| f.to_sat()),
        finalized: psbt.is_finalized(),
    }
}

fn build_tree(summary: &PsbtSummary, scheme: &ColorScheme) -> ptree::item::StringItem {
    let mut tree = TreeBuilder::new(scheme.label("psbt"));
    tree.add_empty_child(scheme.field("txid", &summary.txid));
    tree.add_empty_child(scheme.field("version", summary.version));
    tree.add_empty_child(scheme.field("locktime", summary.locktime));
    match summary.fee {
        Some(fee) => tree.add_empty_child(scheme.field("fee", fee)),
        None => tree.add_empty_child(scheme.field("fee", "unknown")),
    };

    tree.begin_child(scheme.label(&format!("inputs ({})", summary.inputs.len())));
    for input in &summary.inputs {
        tree.begin_child(scheme.label(&format!("input {}", input.index)));
        tree.add_empty_child(scheme.field("previous_output", &input.previous_output));
        tree.add_empty_child(scheme.field("sequence", format!("{:#010x}", input.sequence)));
        tree.add_empty_child(scheme.field(
            "type",
            input.input_type.as_deref().unwrap_or("unknown"),
        ));
        if let Some(value) = input.value {
            tree.add_empty_child(scheme.field("value", value));
        }
        if input.finalized {
            tree.add_empty_child(scheme.status(true, "finalized"));
        } else {
            let sigs = input.partial_sigs + input.tap_script_sigs + usize::from(input.tap_key_sig);
            tree.add_empty_child(scheme.field("signatures", sigs));
        }
        tree.end_child();
    }
    tree.end_child();

    tree.begin_child(scheme.label(&format!("outputs ({})", summary.outputs.len())));
    for output in &summary.outputs {
        tree.begin_child(scheme.label(&format!("output {}", output.index)));
        tree.add_empty_child(scheme.field("value", output.value));
        tree.add_empty_child(scheme.field("type", &output.script_type));
        if let Some(address) = &output.address {
            tree.add_empty_child(scheme.field("address", address));
        }
        tree.end_child();
    }
    tree.end_child();

    tree.add_empty_child(scheme.status(
        summary.finalized,
        if summary.finalized { "finalized" } else { "not finalized" },
    ));
    tree.build()
}

pub fn handle_parse_command(path: PathBuf, network: Network, no_color: bool, json: bool) -> Result<()> {
    let psbt = load_psbt(
        &path,
        PsbtOpts {
            network,
            ..Default::default()
        },
    )?;
    let summary = summarize(&psbt, network);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let scheme = if no_color {
        ColorScheme::no_color()
    } else {
        ColorScheme::default()
    };
    render_tree(&build_tree(&summary, &scheme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psbt::fee::fee_report;
    use utxo_psbt::bitcoin::hashes::Hash;
    use utxo_psbt::bitcoin::secp256k1::{Secp256k1, SecretKey};
    use utxo_psbt::bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, TxOut, Txid};
    use utxo_psbt::psbt::{InputSpec, OutputSpec};

    fn p2wpkh(seed: u8) -> ScriptBuf {
        let secp = Secp256k1::new();
        let key = PublicKey::new(SecretKey::from_slice(&[seed; 32]).unwrap().public_key(&secp));
        ScriptBuf::new_p2wpkh(&key.wpubkey_hash().unwrap())
    }

    fn document() -> Psbt {
        let mut psbt = Psbt::new(PsbtOpts::default());
        let mut spec = InputSpec::new(OutPoint::new(Txid::from_byte_array([1; 32]), 0));
        spec.update.witness_utxo = Some(TxOut {
            value: Amount::from_sat(20_000),
            script_pubkey: p2wpkh(1),
        });
        psbt.add_input(spec).unwrap();
        psbt.add_output(OutputSpec::script(p2wpkh(2), Amount::from_sat(15_000)))
            .unwrap();
        psbt
    }

    #[test]
    fn test_summarize() {
        let summary = summarize(&document(), Network::Bitcoin);
        assert_eq!(summary.inputs.len(), 1);
        assert_eq!(summary.inputs[0].input_type.as_deref(), Some("p2wpkh"));
        assert_eq!(summary.inputs[0].value, Some(20_000));
        assert_eq!(summary.outputs[0].script_type, "p2wpkh");
        assert!(summary.outputs[0].address.as_deref().unwrap().starts_with("bc1q"));
        assert_eq!(summary.fee, Some(5_000));
        assert!(!summary.finalized);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outputs"][0]["value"], 15_000);
    }

    #[test]
    fn test_tree_without_color() {
        let tree = build_tree(&summarize(&document(), Network::Bitcoin), &ColorScheme::no_color());
        let mut out = Vec::new();
        ptree::write_tree(&tree, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("inputs (1)"));
        assert!(text.contains("fee: 5000"));
        assert!(text.contains("not finalized"));
    }

    #[test]
    fn test_fee_report_unfinalized() {
        let report = fee_report(&document()).unwrap();
        assert_eq!(
            report,
            crate::psbt::fee::FeeReport {
                fee: 5_000,
                fee_rate: None
            }
        );
    }
}
