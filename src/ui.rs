//! Terminal output for `pacer`: a live progress bar and a coloured summary.
//!
//! [`QueueProgress`] polls [`QueueStats`] and renders them with `indicatif`;
//! outcomes are coloured with `console` (green uploaded, cyan already stored,
//! red failed, yellow cancelled).

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::queue::QueueStats;
use crate::state_machine::{ItemState, WorkItem};

const BAR_SCALE: u64 = 1000;

pub struct QueueProgress {
    pb: ProgressBar,
    green: Style,
    cyan: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl QueueProgress {
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(BAR_SCALE);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] [{bar:32.cyan/blue}] {percent:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message(format!("{total} file(s) queued"));
        pb.enable_steady_tick(Duration::from_millis(120));

        Self {
            pb,
            green: Style::new().green().bold(),
            cyan: Style::new().cyan(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn update(&self, stats: &QueueStats) {
        self.pb
            .set_position((stats.aggregate_progress * BAR_SCALE as f64).round() as u64);
        self.pb.set_message(format!(
            "{}/{} done · {} active · {} retrying · {}/s",
            stats.succeeded + stats.duplicate + stats.failed + stats.cancelled,
            stats.total,
            stats.in_flight,
            stats.retrying,
            human_bytes(stats.throughput_bps as u64),
        ));
    }

    /// Print a line above the bar without disturbing it.
    pub fn note(&self, line: impl AsRef<str>) {
        self.pb.println(line.as_ref());
    }

    pub fn finish(&self, stats: &QueueStats, items: &[WorkItem]) {
        self.pb.finish_and_clear();
        for item in items {
            let (mark, style) = match item.state {
                ItemState::Succeeded => ("✓", &self.green),
                ItemState::Duplicate => ("=", &self.cyan),
                ItemState::Failed => ("✗", &self.red),
                ItemState::Cancelled => ("-", &self.yellow),
                _ => ("…", &self.dim),
            };
            let detail = match (&item.state, &item.last_error) {
                (ItemState::Failed, Some(err)) => format!(" ({err})"),
                _ => String::new(),
            };
            println!(
                "  {} {} {}{}",
                style.apply_to(mark),
                item.identity,
                self.dim.apply_to(human_bytes(item.size)),
                detail
            );
        }

        println!();
        println!(
            "  {} uploaded, {} already stored, {} failed, {} cancelled · {} sent",
            self.green.apply_to(stats.succeeded),
            self.cyan.apply_to(stats.duplicate),
            self.red.apply_to(stats.failed),
            self.yellow.apply_to(stats.cancelled),
            human_bytes(stats.bytes_transferred),
        );
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
