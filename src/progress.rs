//! Progress display for downloads and uploads
//!
//! Draws to stderr and only when stderr is a terminal, so piped output and
//! tests stay clean.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;

pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Byte-counting bar; the length is filled in once the host reports it.
    pub fn bytes(label: &str) -> Self {
        if !std::io::stderr().is_terminal() {
            return Self::hidden();
        }
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Indeterminate spinner for operations without a byte count.
    pub fn spinner(label: &str) -> Self {
        if !std::io::stderr().is_terminal() {
            return Self::hidden();
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Reset for a (re)started transfer.
    pub fn start(&self, total: Option<u64>) {
        self.bar.set_position(0);
        if let Some(total) = total {
            self.bar.set_length(total);
        }
    }

    pub fn advance(&self, n: u64) {
        self.bar.inc(n);
    }

    pub fn note(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
