//! Parsers for apt command-line output
//!
//! Everything here assumes the `C` locale, which [`super::AptCache`] forces
//! on every command it runs.

use crate::cache::ChangeSummary;
use crate::version::{Relation, RelationOp};

/// `apt-cache policy <name>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub installed: Option<String>,
    pub candidate: Option<String>,
    /// Every version apt knows about, highest priority source first
    pub versions: Vec<String>,
}

/// `None` when apt does not know the package at all
pub fn parse_policy(output: &str) -> Option<Policy> {
    let mut policy = Policy::default();
    let mut known = false;
    let mut in_table = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("Installed:") {
            known = true;
            policy.installed = version_field(value);
        } else if let Some(value) = trimmed.strip_prefix("Candidate:") {
            known = true;
            policy.candidate = version_field(value);
        } else if trimmed == "Version table:" {
            in_table = true;
        } else if in_table {
            let entry = trimmed.strip_prefix("***").unwrap_or(trimmed);
            let tokens: Vec<&str> = entry.split_whitespace().collect();
            // Source lines ("500 http://...") follow each version line
            if let [version, priority] = tokens.as_slice() {
                if priority.parse::<i32>().is_ok() && !policy.versions.iter().any(|v| v == version)
                {
                    policy.versions.push(version.to_string());
                }
            }
        }
    }

    known.then_some(policy)
}

fn version_field(value: &str) -> Option<String> {
    match value.trim() {
        "" | "(none)" => None,
        version => Some(version.to_string()),
    }
}

/// One alternative of a dependency field, e.g. `libc6 (>= 2.36)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub relation: Option<Relation>,
}

impl Requirement {
    /// Versions out of `available` this requirement accepts
    pub fn accepts<'a>(&self, available: &'a [String]) -> Vec<&'a String> {
        available
            .iter()
            .filter(|v| self.relation.as_ref().map_or(true, |r| r.is_satisfied_by(v)))
            .collect()
    }
}

/// The `Depends` and `Pre-Depends` of the first record of `apt-cache show`
///
/// Each inner vector is one group of `|` alternatives.
pub fn parse_show_depends(output: &str) -> Vec<Vec<Requirement>> {
    let mut fields: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            // End of the first record
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(field) = current.as_mut() {
                field.push(' ');
                field.push_str(line.trim());
            }
            continue;
        }
        if let Some(field) = current.take() {
            fields.push(field);
        }
        current = line
            .strip_prefix("Pre-Depends:")
            .or_else(|| line.strip_prefix("Depends:"))
            .map(|value| value.trim().to_string());
    }
    if let Some(field) = current {
        fields.push(field);
    }

    fields
        .iter()
        .flat_map(|field| parse_depends(field))
        .collect()
}

/// A dependency field value: `a (>= 1), b | c (<< 2)`
pub fn parse_depends(field: &str) -> Vec<Vec<Requirement>> {
    field
        .split(',')
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(|group| {
            group
                .split('|')
                .filter_map(parse_requirement)
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

fn parse_requirement(text: &str) -> Option<Requirement> {
    // Drop architecture restrictions ([amd64]) and build profiles (<!nocheck>)
    let text = strip_enclosed(strip_enclosed(text, '[', ']').as_str(), '<', '>');
    let text = text.trim();

    let (name, relation) = match text.split_once('(') {
        Some((name, rest)) => {
            let inner = rest.trim_end().trim_end_matches(')').trim();
            (name.trim(), parse_relation(inner))
        }
        None => (text, None),
    };

    // Strip architecture qualifiers such as python3:any
    let name = name.split(':').next().unwrap_or(name).trim();
    if name.is_empty() {
        return None;
    }

    Some(Requirement {
        name: name.to_string(),
        relation,
    })
}

fn parse_relation(text: &str) -> Option<Relation> {
    let split = text
        .find(|c: char| !matches!(c, '<' | '>' | '='))
        .unwrap_or(text.len());
    let (op, version) = text.split_at(split);
    let op = RelationOp::parse(op.trim())?;
    let version = version.trim();
    if version.is_empty() {
        return None;
    }
    Some(Relation {
        op,
        version: version.to_string(),
    })
}

/// Remove every `open...close` span. Operators like `<<` never appear
/// inside package names, so only a `<` that starts a word is a profile.
fn strip_enclosed(text: &str, open: char, close: char) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut previous = ' ';
    let mut inside_relation = false;

    for c in text.chars() {
        match c {
            '(' => inside_relation = true,
            ')' => inside_relation = false,
            _ => {}
        }
        if !inside_relation && c == open && (depth > 0 || previous.is_whitespace()) {
            depth += 1;
        } else if depth > 0 && c == close {
            depth -= 1;
        } else if depth == 0 {
            out.push(c);
        }
        previous = c;
    }
    out
}

/// A line written to `APT::Status-Fd`
#[derive(Debug, Clone, PartialEq)]
pub enum StatusLine {
    Download { percent: f64, description: String },
    Install { percent: f64, description: String },
    Error { package: String, message: String },
}

pub fn parse_status_line(line: &str) -> Option<StatusLine> {
    let (kind, rest) = line.trim_end().split_once(':')?;
    let fields: Vec<&str> = rest.split(':').collect();
    // The subject may carry an architecture ("libc6:arm64"), so the percent
    // is the first numeric field after it
    let at = (1..fields.len()).find(|&i| fields[i].trim().parse::<f64>().is_ok())?;
    let subject = fields[..at].join(":");
    let percent = fields[at].trim().parse::<f64>().ok()?;
    let description = fields[at + 1..].join(":");

    match kind {
        "dlstatus" => Some(StatusLine::Download {
            percent,
            description,
        }),
        "pmstatus" => Some(StatusLine::Install {
            percent,
            description,
        }),
        "pmerror" => Some(StatusLine::Error {
            package: package_from_subject(&subject),
            message: description,
        }),
        _ => None,
    }
}

/// pmerror names either a package or the .deb archive it came from
fn package_from_subject(subject: &str) -> String {
    let file = subject.rsplit('/').next().unwrap_or(subject);
    match file.strip_suffix(".deb") {
        Some(archive) => archive.split('_').next().unwrap_or(archive).to_string(),
        None => file.split(':').next().unwrap_or(file).to_string(),
    }
}

/// The summary apt prints before asking for confirmation
pub fn parse_summary(output: &str) -> ChangeSummary {
    let mut summary = ChangeSummary::default();

    for line in output.lines().map(str::trim) {
        if line.contains(" upgraded,") && line.contains(" newly installed") {
            summary.install_count = line
                .split(',')
                .filter_map(|part| {
                    let part = part.trim();
                    let (count, label) = part.split_once(' ')?;
                    (label == "upgraded" || label == "newly installed")
                        .then(|| count.parse::<u64>().ok())
                        .flatten()
                })
                .sum();
        } else if let Some(rest) = line.strip_prefix("Need to get ") {
            // "Need to get 0 B/2155 MB of archives." lists what is left to fetch first
            let amount = rest.split(" of ").next().unwrap_or(rest);
            let amount = amount.split('/').next().unwrap_or(amount);
            if let Some(bytes) = parse_size(amount) {
                summary.download_size = bytes;
            }
        } else if let Some(rest) = line.strip_prefix("After this operation, ") {
            let amount: String = rest
                .split_whitespace()
                .take(2)
                .collect::<Vec<_>>()
                .join(" ");
            if let Some(bytes) = parse_size(&amount) {
                let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
                summary.required_space = if rest.contains("freed") { -bytes } else { bytes };
            }
        }
    }

    summary
}

/// "2,155 MB" -> 2155000000 (apt uses SI units)
pub fn parse_size(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let number: f64 = parts.next()?.replace(',', "").parse().ok()?;
    let multiplier = match parts.next()? {
        "B" => 1.0,
        "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}
