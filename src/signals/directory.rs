//! Signal files dropped into a directory by external producers.
//!
//! Each file holds one symbol per line. Files whose name contains "sell" carry
//! sell signals, all others buy signals. A file is claimed by renaming it
//! before it is read and is deleted afterwards, so each file is consumed once.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::fs;
use tracing::{debug, error, warn};

use crate::models::Signal;

use super::SignalSender;

const CLAIM_SUFFIX: &str = ".claimed";

/// Importer for a directory of signal files.
#[derive(Debug, Clone)]
pub struct SignalDirectory {
    path: PathBuf,
    quote: String,
}

impl SignalDirectory {
    pub fn new(path: impl Into<PathBuf>, quote: &str) -> Self {
        Self {
            path: path.into(),
            quote: quote.to_uppercase(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim, read and delete every pending signal file.
    pub async fn collect(&self) -> Result<Vec<Signal>> {
        fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("Failed to create signal directory {}", self.path.display()))?;

        let mut entries = fs::read_dir(&self.path)
            .await
            .with_context(|| format!("Failed to read signal directory {}", self.path.display()))?;

        let mut signals = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_signal_file(&name) || !entry.file_type().await?.is_file() {
                continue;
            }

            match self.consume(&entry.path(), &name).await {
                Ok(mut parsed) => {
                    debug!(file = %name, count = parsed.len(), "Imported signal file");
                    signals.append(&mut parsed);
                }
                Err(e) => warn!(file = %name, category = "data", error = %e, "Skipping signal file"),
            }
        }

        Ok(signals)
    }

    async fn consume(&self, path: &Path, name: &str) -> Result<Vec<Signal>> {
        let claimed = path.with_file_name(format!("{}{}", name, CLAIM_SUFFIX));
        // Another reader may have claimed it first; the rename fails for the loser.
        fs::rename(path, &claimed)
            .await
            .context("File already claimed")?;

        let contents = fs::read_to_string(&claimed).await;
        fs::remove_file(&claimed)
            .await
            .context("Failed to remove claimed signal file")?;

        Ok(parse_signal_file(name, &contents?, &self.quote))
    }

    /// Poll the directory every `interval` and forward signals until shutdown.
    pub fn spawn(
        self,
        sender: SignalSender,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while !shutdown.load(Ordering::SeqCst) && !sender.is_closed() {
                ticker.tick().await;
                match self.collect().await {
                    Ok(signals) => {
                        // Files are already consumed; a full queue drops the rest.
                        for signal in signals {
                            sender.offer(signal);
                        }
                    }
                    Err(e) => error!(error = %e, "Signal directory scan failed"),
                }
            }
        })
    }
}

fn is_signal_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    !lower.starts_with("readme") && !lower.starts_with('.') && !lower.ends_with(CLAIM_SUFFIX)
}

/// Parse one signal file. Each line is a symbol, optionally followed by a
/// numeric strength. Lines that are empty or not quoted in `quote` are dropped.
pub fn parse_signal_file(name: &str, contents: &str, quote: &str) -> Vec<Signal> {
    let is_sell = name.to_lowercase().contains("sell");
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|field| !field.is_empty());
            let symbol = fields.next()?.to_uppercase();
            let strength = fields.next().and_then(|raw| Decimal::from_str(raw).ok());
            (symbol.len() > quote.len() && symbol.ends_with(quote)).then_some((symbol, strength))
        })
        .map(|(symbol, strength)| {
            if is_sell {
                Signal::sell(symbol, name)
            } else {
                Signal::buy(symbol, name).with_strength(strength)
            }
        })
        .collect()
}
