//! Path patterns for targets delegation.
//!
//! A pattern is matched segment-wise against `/`-separated target paths. Each segment is either
//! a literal, `*` (exactly one segment), or a trailing `**` (one or more remaining segments).
//! Wildcard positions of a matching path can be extracted as captures, which lets a caller
//! cross-check the concrete path a delegated role claims to control.

use crate::schema::error::{self, Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ensure;
use std::fmt;
use std::str::FromStr;

/// A compiled delegation path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
    original: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    AnyOne,
    AnyTail,
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ensure!(
            !s.is_empty(),
            error::InvalidPatternSnafu {
                pattern: s,
                reason: "pattern is empty",
            }
        );
        ensure!(
            !s.starts_with('/') && !s.ends_with('/'),
            error::InvalidPatternSnafu {
                pattern: s,
                reason: "pattern must not start or end with '/'",
            }
        );

        let parts: Vec<&str> = s.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (position, part) in parts.iter().enumerate() {
            match *part {
                "" => {
                    return error::InvalidPatternSnafu {
                        pattern: s,
                        reason: "pattern contains an empty segment",
                    }
                    .fail()
                }
                "*" => segments.push(Segment::AnyOne),
                "**" => {
                    ensure!(
                        position == parts.len() - 1,
                        error::InvalidPatternSnafu {
                            pattern: s,
                            reason: "'**' is only allowed as the final segment",
                        }
                    );
                    segments.push(Segment::AnyTail);
                }
                literal => {
                    ensure!(
                        !literal.contains('*'),
                        error::InvalidPatternSnafu {
                            pattern: s,
                            reason: "'*' cannot appear inside a segment",
                        }
                    );
                    segments.push(Segment::Literal(literal.to_owned()));
                }
            }
        }

        Ok(Self {
            segments,
            original: s.to_owned(),
        })
    }
}

impl Pattern {
    /// Whether `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.captures(path).is_some()
    }

    /// Matches `path` against this pattern, returning the path fragments bound to each wildcard
    /// position, in order. A trailing `**` captures the entire remainder as one fragment.
    ///
    /// Returns `None` when the path does not match.
    pub fn captures<'p>(&self, path: &'p str) -> Option<Vec<&'p str>> {
        if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
            return None;
        }

        let mut captures = Vec::new();
        let mut rest = path;
        for (position, segment) in self.segments.iter().enumerate() {
            let last = position == self.segments.len() - 1;
            match segment {
                Segment::AnyTail => {
                    // Parsing guarantees this is the final segment. At least one path segment
                    // must remain.
                    if rest.is_empty() {
                        return None;
                    }
                    captures.push(rest);
                    rest = "";
                }
                Segment::AnyOne | Segment::Literal(_) => {
                    let (head, tail) = match rest.split_once('/') {
                        Some((head, tail)) => (head, tail),
                        None => (rest, ""),
                    };
                    if head.is_empty() {
                        return None;
                    }
                    if let Segment::Literal(literal) = segment {
                        if head != literal {
                            return None;
                        }
                    } else {
                        captures.push(head);
                    }
                    if last && !tail.is_empty() {
                        return None;
                    }
                    rest = tail;
                }
            }
        }

        rest.is_empty().then_some(captures)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Pattern {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}
