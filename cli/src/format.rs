//! Terminal rendering helpers.

use anyhow::Result;
use colored::Colorize;
use ptree::item::StringItem;
use std::fmt::Display;

#[derive(Debug, Clone, Copy)]
pub struct ColorScheme {
    enabled: bool,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ColorScheme {
    pub fn no_color() -> Self {
        Self { enabled: false }
    }

    pub fn label(&self, text: &str) -> String {
        if self.enabled {
            text.bold().to_string()
        } else {
            text.to_string()
        }
    }

    /// `key: value`, with the value highlighted.
    pub fn field(&self, key: &str, value: impl Display) -> String {
        let value = value.to_string();
        if self.enabled {
            format!("{}: {}", key.cyan(), value.yellow())
        } else {
            format!("{}: {}", key, value)
        }
    }

    pub fn status(&self, ok: bool, text: &str) -> String {
        match (self.enabled, ok) {
            (false, _) => text.to_string(),
            (true, true) => text.green().to_string(),
            (true, false) => text.red().to_string(),
        }
    }
}

pub fn render_tree(tree: &StringItem) -> Result<()> {
    ptree::print_tree(tree)?;
    Ok(())
}
