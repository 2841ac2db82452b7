//! Debian package version ordering
//!
//! Versions look like `[epoch:]upstream[-revision]`. Comparison follows dpkg:
//! epochs numerically, then upstream and revision with the alternating
//! non-digit / digit algorithm where `~` sorts before everything, even the
//! end of the string.

use std::cmp::Ordering;
use std::fmt;

/// Compare two Debian version strings
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a_epoch, a_upstream, a_revision) = split(a);
    let (b_epoch, b_upstream, b_revision) = split(b);

    a_epoch
        .cmp(&b_epoch)
        .then_with(|| compare_part(a_upstream, b_upstream))
        .then_with(|| compare_part(a_revision, b_revision))
}

/// Highest version of a set, by Debian ordering
pub fn highest<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    versions
        .into_iter()
        .map(String::as_str)
        .max_by(|a, b| compare_versions(a, b))
}

fn split(version: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match version.split_once(':') {
        Some((epoch, rest)) => match epoch.parse::<u64>() {
            Ok(epoch) => (epoch, rest),
            Err(_) => (0, version),
        },
        None => (0, version),
    };

    match rest.rsplit_once('-') {
        Some((upstream, revision)) => (epoch, upstream, revision),
        None => (epoch, rest, ""),
    }
}

fn order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(b'~') => -1,
        Some(c) => i32::from(c) + 256,
    }
}

fn compare_part(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        let is_text = |s: &[u8], k: usize| k < s.len() && !s[k].is_ascii_digit();

        while is_text(a, i) || is_text(b, j) {
            let ac = order(a.get(i).copied());
            let bc = order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while a.get(i) == Some(&b'0') {
            i += 1;
        }
        while b.get(j) == Some(&b'0') {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while i < a.len() && j < b.len() && a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }

        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

/// Version relation operator used in `Depends` fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOp {
    Earlier,
    EarlierOrEqual,
    Exactly,
    LaterOrEqual,
    Later,
}

impl RelationOp {
    /// `<` and `>` are the deprecated spellings of `<=` and `>=`
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "<<" => Some(RelationOp::Earlier),
            "<=" | "<" => Some(RelationOp::EarlierOrEqual),
            "=" => Some(RelationOp::Exactly),
            ">=" | ">" => Some(RelationOp::LaterOrEqual),
            ">>" => Some(RelationOp::Later),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RelationOp::Earlier => "<<",
            RelationOp::EarlierOrEqual => "<=",
            RelationOp::Exactly => "=",
            RelationOp::LaterOrEqual => ">=",
            RelationOp::Later => ">>",
        }
    }
}

/// A version constraint such as `>= 1.2-1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub op: RelationOp,
    pub version: String,
}

impl Relation {
    pub fn is_satisfied_by(&self, version: &str) -> bool {
        let ordering = compare_versions(version, &self.version);
        match self.op {
            RelationOp::Earlier => ordering == Ordering::Less,
            RelationOp::EarlierOrEqual => ordering != Ordering::Greater,
            RelationOp::Exactly => ordering == Ordering::Equal,
            RelationOp::LaterOrEqual => ordering != Ordering::Less,
            RelationOp::Later => ordering == Ordering::Greater,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}
