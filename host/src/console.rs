//! Line-based operator console on stdin.

use anyhow::{Result, anyhow, bail};
use utm_remote_core::{ClientRecord, Fingerprint};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Allow(String),
    Deny(String),
    /// `None` disconnects every client.
    Disconnect(Option<String>),
    Forget(String),
    List,
    Reset,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  list                    show known clients and sessions
  allow <fingerprint>     approve a client
  deny <fingerprint>      block a client
  disconnect <fp|all>     close sessions without changing trust
  forget <fingerprint>    remove a client from every list
  reset                   regenerate the server identity
  quit";

pub fn parse(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let argument = words.next().map(str::to_string);
    if words.next().is_some() {
        bail!("Too many arguments");
    }

    let required = |name: &str| argument.clone().ok_or_else(|| anyhow!("Usage: {} <fingerprint>", name));

    let command = match verb.to_ascii_lowercase().as_str() {
        "allow" | "approve" => ConsoleCommand::Allow(required("allow")?),
        "deny" | "block" => ConsoleCommand::Deny(required("deny")?),
        "disconnect" => match argument.as_deref() {
            None | Some("all") => ConsoleCommand::Disconnect(None),
            Some(_) => ConsoleCommand::Disconnect(argument),
        },
        "forget" => ConsoleCommand::Forget(required("forget")?),
        "list" | "ls" => ConsoleCommand::List,
        "reset" => ConsoleCommand::Reset,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("Unknown command '{}'. Type 'help'.", other),
    };
    Ok(Some(command))
}

/// Resolve a full fingerprint, or a unique hex prefix of a known client.
pub fn resolve(text: &str, known: &[ClientRecord]) -> Result<Fingerprint> {
    if let Ok(fingerprint) = text.parse::<Fingerprint>() {
        return Ok(fingerprint);
    }

    let needle: String = text
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_uppercase();
    if needle.is_empty() {
        bail!("Empty fingerprint");
    }

    let mut matches = known
        .iter()
        .map(|record| record.entry.fingerprint)
        .filter(|fp| fp.to_hex().replace(':', "").starts_with(&needle));
    match (matches.next(), matches.next()) {
        (Some(fingerprint), None) => Ok(fingerprint),
        (None, _) => bail!("No known client matches '{}'", text),
        (Some(_), Some(_)) => bail!("'{}' matches more than one client", text),
    }
}

pub fn format_clients(records: &[ClientRecord]) -> String {
    if records.is_empty() {
        return "No known clients".to_string();
    }
    records
        .iter()
        .map(|record| {
            let session = record
                .session
                .map(|s| format!("{:?}", s).to_lowercase())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{:<10} {:<12} {:<24} {}",
                format!("{:?}", record.status).to_lowercase(),
                session,
                record.entry.display_name,
                record.entry.fingerprint
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
