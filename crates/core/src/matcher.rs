//! Restricted glob algebra over snapshot paths
//!
//! A matcher is an ordered list of patterns. A pattern prefixed with `!`
//! excludes, anything else includes, and the last pattern that matches a
//! path decides. Paths nothing matches are excluded.
//!
//! Patterns are split on `/`. A segment of exactly `**` matches zero or more
//! path components; any other segment is matched against exactly one
//! component, with `*`, `?` and `[...]` wildcards. A pattern `a` matches the
//! path `a` only; use `a/**` to take everything below a directory.

use crate::error::{Error, Result};
use crate::path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const WILDCARD_CHARS: &[char] = &['*', '?', '['];

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Wild(glob::Pattern),
    DoubleStar,
}

impl Segment {
    fn parse(text: &str) -> Result<Self> {
        if text == "**" {
            return Ok(Segment::DoubleStar);
        }
        if !text.contains(WILDCARD_CHARS) {
            return Ok(Segment::Literal(text.to_string()));
        }
        glob::Pattern::new(text)
            .map(Segment::Wild)
            .map_err(|e| Error::InvalidArgument(format!("invalid glob {:?}: {}", text, e)))
    }

    fn matches(&self, component: &str) -> bool {
        match self {
            Segment::Literal(lit) => lit == component,
            Segment::Wild(pattern) => pattern.matches(component),
            Segment::DoubleStar => true,
        }
    }

    fn to_text(&self) -> String {
        match self {
            Segment::Literal(lit) if lit.contains(WILDCARD_CHARS) || lit == "**" => {
                glob::Pattern::escape(lit)
            }
            Segment::Literal(lit) => lit.clone(),
            Segment::Wild(pattern) => pattern.as_str().to_string(),
            Segment::DoubleStar => "**".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    negated: bool,
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(line: &str) -> Result<Self> {
        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            return Err(Error::InvalidArgument(format!("empty pattern {:?}", line)));
        }
        let segments = body
            .split('/')
            .filter(|s| !s.is_empty())
            .map(Segment::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { negated, segments })
    }

    fn literal(path: &str) -> Self {
        Self {
            negated: false,
            segments: path::components(path)
                .map(|c| Segment::Literal(c.to_string()))
                .collect(),
        }
    }

    fn matches(&self, components: &[&str]) -> bool {
        match_segments(&self.segments, components)
    }

    /// The path this pattern names when it has no wildcards
    fn literal_path(&self) -> Option<String> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => parts.push(lit.as_str()),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }

    fn is_match_all(&self) -> bool {
        matches!(self.segments.as_slice(), [Segment::DoubleStar])
    }

    /// Remainders of this pattern after consuming `components`
    fn residuals(&self, components: &[&str]) -> Vec<Pattern> {
        let mut states = closure(&self.segments, BTreeSet::from([0]));
        for component in components {
            let mut next = BTreeSet::new();
            for &i in &states {
                match self.segments.get(i) {
                    Some(Segment::DoubleStar) => {
                        next.insert(i);
                    }
                    Some(segment) if segment.matches(component) => {
                        next.insert(i + 1);
                    }
                    _ => {}
                }
            }
            states = closure(&self.segments, next);
            if states.is_empty() {
                return Vec::new();
            }
        }

        let mut out: Vec<Pattern> = Vec::new();
        for &i in &states {
            // A `**` state already covers the state right after it
            if i > 0 && matches!(self.segments.get(i - 1), Some(Segment::DoubleStar)) && states.contains(&(i - 1)) {
                continue;
            }
            out.push(Pattern {
                negated: self.negated,
                segments: self.segments[i..].to_vec(),
            });
        }
        out
    }

    fn to_text(&self) -> String {
        let body = self
            .segments
            .iter()
            .map(Segment::to_text)
            .collect::<Vec<_>>()
            .join("/");
        if self.negated {
            format!("!{}", body)
        } else {
            body
        }
    }
}

/// Follow `**` epsilon transitions
fn closure(segments: &[Segment], mut states: BTreeSet<usize>) -> BTreeSet<usize> {
    let mut pending: Vec<usize> = states.iter().copied().collect();
    while let Some(i) = pending.pop() {
        if matches!(segments.get(i), Some(Segment::DoubleStar)) && states.insert(i + 1) {
            pending.push(i + 1);
        }
    }
    states
}

fn match_segments(segments: &[Segment], components: &[&str]) -> bool {
    match segments.split_first() {
        None => components.is_empty(),
        Some((Segment::DoubleStar, rest)) => {
            (0..=components.len()).any(|skip| match_segments(rest, &components[skip..]))
        }
        Some((segment, rest)) => match components.split_first() {
            Some((first, tail)) => segment.matches(first) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// Ordered include/exclude glob set over snapshot paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct PathMatcher {
    patterns: Vec<Pattern>,
}

impl PathMatcher {
    /// Parse an ordered list of patterns
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Pattern::parse(p.as_ref().trim()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Matches every path
    pub fn all() -> Self {
        Self {
            patterns: vec![Pattern {
                negated: false,
                segments: vec![Segment::DoubleStar],
            }],
        }
    }

    /// Matches nothing
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Matches exactly the given paths
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: paths
                .into_iter()
                .map(|p| Pattern::literal(p.as_ref()))
                .collect(),
        }
    }

    /// Matches the given paths and everything below them
    pub fn from_prefixes<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: paths
                .into_iter()
                .map(|p| {
                    let mut pattern = Pattern::literal(p.as_ref());
                    pattern.segments.push(Segment::DoubleStar);
                    pattern
                })
                .collect(),
        }
    }

    /// Whether `path` is selected
    pub fn matches(&self, path: &str) -> bool {
        let components: Vec<&str> = path::components(path).collect();
        self.matches_components(&components)
    }

    fn matches_components(&self, components: &[&str]) -> bool {
        self.patterns
            .iter()
            .rev()
            .find(|p| p.matches(components))
            .map_or(false, |p| !p.negated)
    }

    /// Matcher to use after descending into `prefix`
    ///
    /// `m.child(d).matches(r) == m.matches(d + "/" + r)` for every `r`.
    pub fn child(&self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self.clone();
        }
        let components: Vec<&str> = path::components(prefix).collect();
        Self {
            patterns: self
                .patterns
                .iter()
                .flat_map(|p| p.residuals(&components))
                .collect(),
        }
    }

    /// Matcher to use for a parent whose top-level entry `prefix` holds the
    /// tree this matcher applies to
    ///
    /// `m.subdir(d).matches(d + "/" + r) == m.matches(r)`.
    pub fn subdir(&self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self.clone();
        }
        let head: Vec<Segment> = path::components(prefix)
            .map(|c| Segment::Literal(c.to_string()))
            .collect();
        Self {
            patterns: self
                .patterns
                .iter()
                .map(|p| Pattern {
                    negated: p.negated,
                    segments: head.iter().cloned().chain(p.segments.iter().cloned()).collect(),
                })
                .collect(),
        }
    }

    /// True only when the matcher provably selects nothing
    pub fn is_empty(&self) -> bool {
        let start = self
            .patterns
            .iter()
            .rposition(|p| p.negated && p.is_match_all())
            .map_or(0, |i| i + 1);
        self.patterns[start..].iter().all(|p| p.negated)
    }

    /// True only when the matcher provably selects everything
    pub fn is_all(&self) -> bool {
        match self.patterns.iter().rposition(|p| !p.negated && p.is_match_all()) {
            Some(i) => self.patterns[i + 1..].iter().all(|p| !p.negated),
            None => false,
        }
    }

    /// The finite list of paths selected, when there is one
    pub fn as_file_set(&self) -> Option<Vec<String>> {
        let mut out = Vec::with_capacity(self.patterns.len());
        for pattern in &self.patterns {
            if pattern.negated {
                return None;
            }
            out.push(pattern.literal_path()?);
        }
        out.sort();
        out.dedup();
        Some(out)
    }

    /// True when every include precedes every exclude
    pub fn is_normal_form(&self) -> bool {
        let first_negative = self.patterns.iter().position(|p| p.negated);
        match first_negative {
            Some(i) => self.patterns[i..].iter().all(|p| p.negated),
            None => true,
        }
    }

    /// Reorder into includes-then-excludes when that keeps the meaning
    ///
    /// Only literal includes may move ahead of an earlier exclude, and only
    /// if that exclude does not match them.
    pub fn normalize(&self) -> Option<Self> {
        if self.is_normal_form() {
            return Some(self.clone());
        }
        let mut positives = Vec::new();
        let mut negatives: Vec<Pattern> = Vec::new();
        for pattern in &self.patterns {
            if pattern.negated {
                negatives.push(pattern.clone());
                continue;
            }
            if !negatives.is_empty() {
                let lit = pattern.literal_path()?;
                let components: Vec<&str> = path::components(&lit).collect();
                if negatives.iter().any(|n| n.matches(&components)) {
                    return None;
                }
            }
            positives.push(pattern.clone());
        }
        positives.extend(negatives);
        Some(Self {
            patterns: positives,
        })
    }

    /// Complement of a normal-form matcher
    pub fn invert(&self) -> Result<Self> {
        if !self.is_normal_form() {
            return Err(Error::InvalidArgument(format!(
                "cannot invert matcher that is not in normal form: {}",
                self
            )));
        }
        let mut patterns = vec![Pattern {
            negated: false,
            segments: vec![Segment::DoubleStar],
        }];
        for pattern in &self.patterns {
            patterns.push(Pattern {
                negated: !pattern.negated,
                segments: pattern.segments.clone(),
            });
        }
        // Excludes of the original become includes and must stay last
        patterns[1..].sort_by_key(|p| !p.negated);
        Ok(Self { patterns })
    }

    /// Pattern texts, in order
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(Pattern::to_text).collect()
    }

    /// The single literal path selected, if that is all this matcher selects
    pub fn single_file(&self) -> Option<String> {
        match self.as_file_set()?.as_slice() {
            [one] => Some(one.clone()),
            _ => None,
        }
    }
}

impl Default for PathMatcher {
    fn default() -> Self {
        Self::all()
    }
}

impl PartialEq for PathMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.patterns() == other.patterns()
    }
}

impl Eq for PathMatcher {}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.patterns().join("\n"))
    }
}

impl FromStr for PathMatcher {
    type Err = Error;

    /// One pattern per line; blank lines and `#` comments are skipped
    fn from_str(s: &str) -> Result<Self> {
        Self::new(
            s.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        )
    }
}

impl From<PathMatcher> for Vec<String> {
    fn from(m: PathMatcher) -> Self {
        m.patterns()
    }
}

impl TryFrom<Vec<String>> for PathMatcher {
    type Error = Error;

    fn try_from(value: Vec<String>) -> Result<Self> {
        Self::new(value)
    }
}
