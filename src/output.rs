//! Command output: a versioned JSON envelope for `--json`, a compact text
//! block otherwise.
//!
//! Every command reports through [`emit_success`] with a [`HumanOutput`]
//! describing the text form; the JSON form carries the command's own data
//! plus the warnings and next steps collected in the same `HumanOutput`.

use std::fmt;

use serde::Serialize;

use crate::error::{exit_codes, Error, Result};

pub const SCHEMA_VERSION: &str = "tally.v1";

/// Commands that take a subcommand, for naming commands in error output
const GROUP_COMMANDS: &[&str] = &["actor"];

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

/// Text rendering of a command result
///
/// Renders as the header, an aligned `key  value` block, indented detail
/// lines, then `warning:` and `next:` lines.
#[derive(Debug, Clone, Default)]
pub struct HumanOutput {
    header: String,
    summary: Vec<(String, String)>,
    details: Vec<String>,
    warnings: Vec<String>,
    next_steps: Vec<String>,
}

impl HumanOutput {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            ..Self::default()
        }
    }

    /// A `key value` line; an empty value renders the key alone.
    pub fn push_summary(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.summary.push((key.into(), value.into()));
    }

    pub fn push_detail(&mut self, value: impl Into<String>) {
        self.details.push(value.into());
    }

    pub fn push_warning(&mut self, value: impl Into<String>) {
        self.warnings.push(value.into());
    }

    /// A command worth running next; the first one doubles as the error hint.
    pub fn push_next_step(&mut self, value: impl Into<String>) {
        self.next_steps.push(value.into());
    }
}

impl fmt::Display for HumanOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;

        let width = self.summary.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in &self.summary {
            if value.is_empty() {
                write!(f, "\n  {key}")?;
            } else {
                write!(f, "\n  {key:<width$}  {value}")?;
            }
        }
        for detail in &self.details {
            write!(f, "\n    {detail}")?;
        }
        for warning in &self.warnings {
            write!(f, "\nwarning: {warning}")?;
        }
        for step in &self.next_steps {
            write!(f, "\nnext: {step}")?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Success,
    Error,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    code: i32,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            code: err.exit_code(),
            kind: error_kind(err),
            details: err.details(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    warnings: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    next_steps: &'a [String],
}

impl<T: Serialize> Envelope<'_, T> {
    fn print(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    human: Option<&HumanOutput>,
) -> Result<()> {
    if options.json {
        let (warnings, next_steps) = match human {
            Some(human) => (human.warnings.as_slice(), human.next_steps.as_slice()),
            None => (&[][..], &[][..]),
        };
        return Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: Status::Success,
            data: Some(data),
            error: None,
            warnings,
            next_steps,
        }
        .print();
    }

    match human {
        Some(human) if !options.quiet => println!("{human}"),
        _ => {}
    }
    Ok(())
}

/// Report a failed command: the envelope on stdout in JSON mode, otherwise
/// `error:` and an optional `hint:` on stderr.
pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    let hints = error_next_steps(err);
    if json {
        return Envelope::<()> {
            schema_version: SCHEMA_VERSION,
            command,
            status: Status::Error,
            data: None,
            error: Some(ErrorBody::from(err)),
            warnings: &[],
            next_steps: &hints,
        }
        .print();
    }

    eprintln!("error: {err}");
    if let Some(hint) = hints.first() {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

pub fn infer_command_name_from_args() -> String {
    infer_command_name(std::env::args().skip(1))
}

/// First positional argument, or `group sub` for grouped commands.
fn infer_command_name(args: impl IntoIterator<Item = String>) -> String {
    let mut positionals = args.into_iter().filter(|arg| !arg.starts_with('-'));

    let Some(command) = positionals.next() else {
        return "tally".to_string();
    };
    match positionals.next() {
        Some(sub) if GROUP_COMMANDS.contains(&command.as_str()) => format!("{command} {sub}"),
        _ => command,
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err.exit_code() {
        exit_codes::USER_ERROR => "user_error",
        exit_codes::POLICY_BLOCKED => "policy_blocked",
        _ => "operation_failed",
    }
}

fn error_next_steps(err: &Error) -> Vec<String> {
    match err {
        Error::NotInitialized(_) => vec!["tally init".to_string()],
        Error::RepoNotFound(_) | Error::NotARepo(_) => vec!["git init && tally init".to_string()],
        Error::InvalidConfig(_) => vec!["fix .tally.toml then retry".to_string()],
        Error::ItemNotFound(_) => vec!["tally list".to_string()],
        Error::TakeConflict { item, holder } => {
            vec![format!("tally take {item} --from {holder}")]
        }
        Error::DependencyCycle { from, .. } => vec![format!("tally tree {from}")],
        Error::SyncExhausted { .. } | Error::MergeConflict(_) => {
            vec!["tally pull".to_string(), "tally sync".to_string()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn command_names_skip_flags() {
        assert_eq!(infer_command_name(args(&["--json", "show", "12345678"])), "show");
        assert_eq!(infer_command_name(args(&["actor", "--json", "set", "bob"])), "actor set");
        assert_eq!(infer_command_name(args(&["list", "--all"])), "list");
        assert_eq!(infer_command_name(args(&["--quiet"])), "tally");
    }

    #[test]
    fn human_output_aligns_summary() {
        let mut human = HumanOutput::new("tally show: 12345678");
        human.push_summary("status", "open");
        human.push_summary("taken by", "alice");
        human.push_summary("ignored", "");
        human.push_detail("2024-06-01 08:00 alice: lexer first");
        human.push_warning("sync failed");
        human.push_next_step("tally sync");

        assert_eq!(
            human.to_string(),
            "tally show: 12345678\n\
             \x20 status    open\n\
             \x20 taken by  alice\n\
             \x20 ignored\n\
             \x20   2024-06-01 08:00 alice: lexer first\n\
             warning: sync failed\n\
             next: tally sync"
        );
    }

    #[test]
    fn error_envelope_carries_kind_and_hint() {
        let err = Error::TakeConflict {
            item: "12345678".into(),
            holder: "alice".into(),
        };
        let hints = error_next_steps(&err);
        let envelope = Envelope::<()> {
            schema_version: SCHEMA_VERSION,
            command: "take",
            status: Status::Error,
            data: None,
            error: Some(ErrorBody::from(&err)),
            warnings: &[],
            next_steps: &hints,
        };
        let json = serde_json::to_value(&envelope).expect("json");

        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["kind"], "policy_blocked");
        assert_eq!(json["error"]["code"], 3);
        assert_eq!(json["error"]["details"]["holder"], "alice");
        assert_eq!(json["next_steps"][0], "tally take 12345678 --from alice");
        assert!(json.get("data").is_none());
        assert!(json.get("warnings").is_none());
    }
}
