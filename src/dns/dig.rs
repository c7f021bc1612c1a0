use std::{net::IpAddr, process::Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::{TxtLookupError, TxtResolver};

/// [`TxtResolver`] that invokes `dig +short TXT <host>`.
#[derive(Debug, Clone)]
pub struct DigResolver {
    program: String,
    nameserver: Option<IpAddr>,
}

impl DigResolver {
    /// Runs `dig` from `PATH` against the system's configured resolver.
    pub fn new() -> Self {
        Self {
            program: "dig".to_owned(),
            nameserver: None,
        }
    }

    /// Asks `nameserver` instead of the system resolver (`@<ip>`).
    pub fn with_nameserver(mut self, nameserver: IpAddr) -> Self {
        self.nameserver = Some(nameserver);
        self
    }

    /// Runs a different executable, e.g. an absolute path to `dig`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, host: &str) -> Vec<String> {
        let mut args = vec!["+short".to_owned(), "TXT".to_owned(), host.to_owned()];

        if let Some(ns) = self.nameserver {
            args.push(format!("@{ns}"));
        }

        args
    }
}

impl Default for DigResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtResolver for DigResolver {
    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, TxtLookupError> {
        let output = Command::new(&self.program)
            .args(self.args(host))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TxtLookupError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TxtLookupError::Command {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_short_output(&stdout))
    }
}

/// Parses `dig +short TXT` output: one record per line, each made of quoted character-strings.
///
/// Lines that are not quoted (e.g. a `CNAME` target printed before the TXT data, or `;;`
/// diagnostics) are skipped.
fn parse_short_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('"'))
        .map(parse_character_strings)
        .collect()
}

fn parse_character_strings(line: &str) -> String {
    let mut value = String::with_capacity(line.len());
    let mut chars = line.chars();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => quoted = !quoted,
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    value.push(escaped);
                }
            }
            c if quoted => value.push(c),
            _ => {}
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_record() {
        let out = "\"RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8\"\n";
        assert_eq!(
            parse_short_output(out),
            vec!["RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"]
        );
    }

    #[test]
    fn test_parse_multiple_records_and_chunks() {
        let out = "\"abc\" \"123\"\n\"stale\"\nalias.example.test.\n;; connection timed out\n";
        assert_eq!(parse_short_output(out), vec!["abc123", "stale"]);
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(parse_character_strings(r#""a\"b\\c""#), r#"a"b\c"#);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_short_output("").is_empty());
    }

    #[test]
    fn test_args() {
        let dig = DigResolver::new().with_nameserver("1.1.1.1".parse().unwrap());
        assert_eq!(
            dig.args("_acme-challenge.example.test"),
            vec!["+short", "TXT", "_acme-challenge.example.test", "@1.1.1.1"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_lookup_error() {
        let dig = DigResolver::new().with_program("definitely-not-a-dig-binary");

        let err = dig.resolve_txt("example.test").await.unwrap_err();
        assert!(matches!(err, TxtLookupError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_is_lookup_error() {
        let dig = DigResolver::new().with_program("false");

        let err = dig.resolve_txt("example.test").await.unwrap_err();
        assert!(matches!(err, TxtLookupError::Command { .. }));
    }
}
