//! Shared output helpers for the subcommands.

use colored::{ColoredString, Colorize};

fn line(mark: ColoredString, text: impl std::fmt::Display) {
    println!("  {mark} {text}");
}

pub fn section(title: &str) {
    line(">>".bright_cyan().bold(), title.bold());
}

/// Aligned `label: value` row.
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{value}", format!("{label}:"));
}

pub fn success(msg: &str) {
    line("ok".bright_green(), msg);
}

pub fn warn(msg: &str) {
    line("!".bright_yellow(), msg.yellow());
}

/// Printed to stderr.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "error:".bright_red().bold(), msg.bright_red());
}

pub fn hint(msg: &str) {
    line("hint:".dimmed(), msg.dimmed());
}

pub fn blank() {
    println!();
}
