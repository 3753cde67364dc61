//! Terminal output for the banner, toolchain listing and client results.

use std::{collections::BTreeSet, io};

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use crate::{client, toolchain::Registry};

pub struct TextPrinter {
    pub color: bool,
}

impl Default for TextPrinter {
    fn default() -> Self {
        Self { color: io::stdout().is_terminal() }
    }
}

impl TextPrinter {
    fn paint(&self, text: &str, color: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        match color {
            "green" => text.green().to_string(),
            "red" => text.red().to_string(),
            "cyan" => text.cyan().to_string(),
            "yellow" => text.yellow().to_string(),
            _ => text.to_string(),
        }
    }

    pub fn toolchains(&self, registry: &Registry) -> String {
        registry
            .entries()
            .map(|e| format!("  {}: {}", self.paint(e.extension, "cyan"), e.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn banner(&self, addr: &str, registry: &Registry) -> String {
        format!(
            "Compilation relay listening on {}\nSupported file types:\n{}\nPress Ctrl+C to stop the server",
            self.paint(addr, "green"),
            self.toolchains(registry)
        )
    }

    /// Red when the transcript looks like a failure, green otherwise.
    pub fn transcript(&self, text: &str) -> String {
        let color = if client::looks_failed(text) { "red" } else { "green" };
        self.paint(text, color)
    }

    /// Source lines flagged by diagnostics, numbered.
    pub fn flagged_lines(&self, code: &str, lines: &BTreeSet<usize>) -> String {
        code.lines()
            .enumerate()
            .filter(|(i, _)| lines.contains(&(i + 1)))
            .map(|(i, line)| format!("{}| {}", self.paint(&format!("{:>4} ", i + 1), "yellow"), line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_banner_lists_toolchains() {
        let text = TextPrinter { color: false }.banner("127.0.0.1:8080", &Registry::builtin());
        assert!(text.contains("127.0.0.1:8080"));
        assert!(text.contains("  .kt: Kotlin compiler and executor"));
        assert!(text.contains("  .py: Python syntax checker and executor"));
    }

    #[test]
    fn flagged_lines_are_numbered_from_one() {
        let code = "fun main() {\n    println(\"x)\n}";
        let out = TextPrinter { color: false }.flagged_lines(code, &BTreeSet::from([2]));
        assert_eq!(out, "   2 |     println(\"x)");
    }
}
