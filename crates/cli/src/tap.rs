//! TAP version 14 output.

use std::io::{self, Write};

/// Streams test points to stdout as they are reported.
pub struct Tap {
    out: io::Stdout,
    count: usize,
    failures: usize,
}

impl Tap {
    pub fn new() -> Self {
        let tap = Tap {
            out: io::stdout(),
            count: 0,
            failures: 0,
        };
        tap.line("TAP version 14");
        tap
    }

    pub fn ok(&mut self, name: &str) {
        self.count += 1;
        self.line(&format!("ok {} - {}", self.count, name));
    }

    /// Report a failure with a YAML diagnostic block carrying `message`.
    pub fn not_ok(&mut self, name: &str, message: String) {
        self.count += 1;
        self.failures += 1;
        self.line(&format!("not ok {} - {}", self.count, name));
        self.line("  ---");
        for (i, text) in message.lines().enumerate() {
            if i == 0 {
                self.line(&format!("  message: {}", yaml_scalar(text)));
            } else {
                self.line(&format!("    {}", text));
            }
        }
        self.line("  ...");
    }

    pub fn skip(&mut self, name: &str, reason: &str) {
        self.count += 1;
        self.line(&format!("ok {} - {} # SKIP {}", self.count, name, reason));
    }

    pub fn failure_count(&self) -> usize {
        self.failures
    }

    /// Write the plan line. Must be called once, after the last test point.
    pub fn finish(self) {
        self.line(&format!("1..{}", self.count));
    }

    fn line(&self, text: &str) {
        let mut out = self.out.lock();
        // Ignore EPIPE when piped into `head`.
        let _ = writeln!(out, "{}", text);
    }
}

impl Default for Tap {
    fn default() -> Self {
        Self::new()
    }
}

/// Quote a diagnostic value when YAML would otherwise misread it.
fn yaml_scalar(text: &str) -> String {
    let needs_quotes = text.is_empty()
        || text.contains(": ")
        || text.contains(" #")
        || text.starts_with(|c: char| "!&*{}[]|>'\"%@`-?,#".contains(c));
    if needs_quotes {
        format!("'{}'", text.replace('\'', "''"))
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_messages_are_unquoted() {
        assert_eq!(yaml_scalar("expected error"), "expected error");
    }

    #[test]
    fn messages_with_colons_are_quoted() {
        assert_eq!(
            yaml_scalar("insertOne: expected error, got success"),
            "'insertOne: expected error, got success'"
        );
        assert_eq!(yaml_scalar("it's: bad"), "'it''s: bad'");
    }

    #[test]
    fn counts_failures_only() {
        let mut tap = Tap::new();
        tap.ok("a");
        tap.skip("b", "not applicable");
        tap.not_ok("c", "boom".to_string());
        assert_eq!(tap.count, 3);
        assert_eq!(tap.failure_count(), 1);
    }
}
