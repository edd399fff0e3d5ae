//! CLI output formatting.
//!
//! Results go to stdout so they can be piped; errors go to stderr.

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use ybd_lib::run::{Outcome, Summary};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
}

#[derive(Debug, Serialize)]
struct SummaryJson<'a> {
  target: &'a str,
  key: &'a str,
  built: usize,
  fetched: usize,
  total: usize,
  retries: usize,
  elapsed: String,
}

impl<'a> From<&'a Summary> for SummaryJson<'a> {
  fn from(summary: &'a Summary) -> Self {
    SummaryJson {
      target: &summary.target,
      key: &summary.key,
      built: summary.built,
      fetched: summary.fetched,
      total: summary.total,
      retries: summary.retries,
      elapsed: format_elapsed(summary),
    }
  }
}

/// Elapsed time to whole seconds.
pub fn format_elapsed(summary: &Summary) -> String {
  let secs = std::time::Duration::from_secs(summary.elapsed.as_secs());
  humantime::format_duration(secs).to_string()
}

pub fn print_outcome(outcome: &Outcome, format: OutputFormat) -> anyhow::Result<()> {
  match outcome {
    Outcome::Order(order) => {
      if format.is_json() {
        return print_json(order);
      }
      for path in order {
        println!("{path}");
      }
    }
    Outcome::Keys(keys) => {
      if format.is_json() {
        let map: std::collections::BTreeMap<_, _> = keys.iter().cloned().collect();
        return print_json(&map);
      }
      for (path, key) in keys {
        println!("{key}  {path}");
      }
    }
    Outcome::Built(summary) => {
      if format.is_json() {
        return print_json(&SummaryJson::from(summary));
      }
      print_success(&format!("Built {}", summary.target));
      print_stat("Key", &summary.key);
      print_stat("Built", &summary.built.to_string());
      print_stat("Fetched", &summary.fetched.to_string());
      print_stat("Total", &summary.total.to_string());
      if summary.retries > 0 {
        print_stat("Retries", &summary.retries.to_string());
      }
      print_stat("Elapsed", &format_elapsed(summary));
    }
  }
  Ok(())
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
