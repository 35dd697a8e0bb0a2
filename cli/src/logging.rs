//! Console logging through `log` + `log4rs`.

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
    Config,
};
use std::io::IsTerminal;

const CONSOLE_APPENDER: &str = "stderr";

const LOG_LINE_PATTERN_COLORED: &str = "{d(%H:%M:%S%.3f)} [{h({l:5})}] {m} [{M}]{n}";
const LOG_LINE_PATTERN: &str = "{d(%H:%M:%S%.3f)} [{l:5}] {m} [{M}]{n}";

/// Crates that log at the requested level. Everything else stays off.
const WHITELISTED_CRATES: &[&str] = &["utxo_psbt", "utxo_psbt_cli"];

/// Send log records to stderr so stdout only carries command output.
pub fn init_logger(level: LevelFilter) -> anyhow::Result<()> {
    let pattern = if std::io::stderr().is_terminal() {
        LOG_LINE_PATTERN_COLORED
    } else {
        LOG_LINE_PATTERN
    };
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build(CONSOLE_APPENDER, Box::new(console)));
    for crate_name in WHITELISTED_CRATES {
        builder = builder.logger(Logger::builder().build(*crate_name, level));
    }
    let config = builder.build(Root::builder().appender(CONSOLE_APPENDER).build(LevelFilter::Off))?;

    log4rs::init_config(config)?;
    Ok(())
}
