use anyhow::Result;
use clap::{Parser, Subcommand};

mod format;
mod input;
mod logging;
mod network;
mod psbt;

#[derive(Parser)]
#[command(name = "utxo-psbt-cli", version, about = "Inspect, combine, finalize and extract PSBTs")]
struct Cli {
    /// Log level for output on stderr (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// PSBT operations
    #[command(subcommand)]
    Psbt(psbt::PsbtCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.log_level)?;

    match cli.command {
        Commands::Psbt(command) => psbt::handle_command(command),
    }
}
