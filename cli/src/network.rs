//! Network argument type for CLI commands

use clap::ValueEnum;
use utxo_psbt::bitcoin::Network;

/// CLI argument type for network selection
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum NetworkArg {
    #[default]
    Btc,
    Tbtc,
    Signet,
    Regtest,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Btc => Network::Bitcoin,
            NetworkArg::Tbtc => Network::Testnet,
            NetworkArg::Signet => Network::Signet,
            NetworkArg::Regtest => Network::Regtest,
        }
    }
}
