//! Resource path patterns.
//!
//! A pattern is a `/`-delimited sequence of literal segments, optionally
//! ending in a single `*` segment that swallows the rest of the path.

use std::fmt;

use crate::error::{Result, TurnstileError};

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A parsed path pattern such as `/api/users/*`.
///
/// Equality compares parsed segments, so `/api/*`, `api/*` and `/api//*`
/// are the same pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for PathPattern {}

impl PathPattern {
    /// Parse a pattern. `*` is only accepted as the last segment.
    pub fn parse(pattern: &str) -> Result<Self> {
        let parts: Vec<&str> = split_segments(pattern).collect();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            if *part == WILDCARD {
                if i + 1 != parts.len() {
                    return Err(TurnstileError::Config(format!(
                        "Wildcard must be the last segment in pattern: {}",
                        pattern
                    )));
                }
                segments.push(Segment::Wildcard);
            } else if part.contains('*') {
                return Err(TurnstileError::Config(format!(
                    "Partial wildcard segments are not supported: {}",
                    pattern
                )));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as declared.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern ends in a wildcard segment.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard))
    }

    /// Number of literal segments; higher means more specific.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Check whether `path` falls under this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let mut path_segments = split_segments(path);

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return true,
                Segment::Literal(literal) => match path_segments.next() {
                    Some(part) if part == literal => {}
                    _ => return false,
                },
            }
        }

        // A literal-only pattern must consume the whole path.
        path_segments.next().is_none()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Pick the most specific matching pattern for `path`.
///
/// Ties go to the candidate that comes first in iteration order.
pub fn best_match<'a, T, I>(candidates: I, path: &str) -> Option<&'a T>
where
    I: IntoIterator<Item = (&'a PathPattern, &'a T)>,
{
    let mut best: Option<(usize, &'a T)> = None;

    for (pattern, value) in candidates {
        if !pattern.matches(path) {
            continue;
        }
        let score = pattern.specificity();
        match best {
            Some((best_score, _)) if best_score >= score => {}
            _ => best = Some((score, value)),
        }
    }

    best.map(|(_, value)| value)
}
