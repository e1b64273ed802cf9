//! Boundary-aware match finding.
//!
//! `find_matches` walks one text with one matcher and returns the accepted,
//! pairwise non-overlapping spans in offset order. Candidates that would split
//! an identifier, or cross a string literal's delimiters, are rejected.
//! Candidates whose boundary cannot be decided are skipped and reported as
//! `BoundaryAmbiguity` so the caller can log them.

use serde::{Deserialize, Serialize};

use crate::rules::{Boundary, Matcher};

// ============================================================================
// Types
// ============================================================================

/// A `[start, end)` byte range in one text, with the groups captured there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
    pub rule_id: String,
    /// Index 0 is the whole match.
    pub captured_groups: Vec<Option<String>>,
}

impl MatchSpan {
    pub fn matched(&self) -> &str {
        self.captured_groups
            .first()
            .and_then(|g| g.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityReason {
    /// The pattern matched the empty string.
    ZeroWidth,
    /// The match starts exactly where the previous match ended.
    AbutsPreviousMatch,
    /// The match sits in a string literal that never closes.
    UnterminatedLiteral,
}

/// A candidate match that was skipped because its boundary was undecidable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryAmbiguity {
    pub rule_id: String,
    pub start: usize,
    pub end: usize,
    pub reason: AmbiguityReason,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub spans: Vec<MatchSpan>,
    pub ambiguities: Vec<BoundaryAmbiguity>,
}

/// Contents of one quoted literal, delimiters excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralRegion {
    pub start: usize,
    pub end: usize,
    pub quote: char,
    pub terminated: bool,
}

impl LiteralRegion {
    fn contains(&self, start: usize, end: usize) -> bool {
        self.start <= start && end <= self.end
    }
}

enum Verdict {
    Accept,
    Reject,
    Ambiguous(AmbiguityReason),
}

// ============================================================================
// Character classes
// ============================================================================

pub fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn char_before(text: &str, offset: usize) -> Option<char> {
    text[..offset].chars().next_back()
}

fn char_after(text: &str, offset: usize) -> Option<char> {
    text[offset..].chars().next()
}

fn next_char_boundary(text: &str, offset: usize) -> usize {
    char_after(text, offset)
        .map(|c| offset + c.len_utf8())
        .unwrap_or(text.len() + 1)
}

/// `\b` discipline: a side is checked only where the match itself ends in an
/// identifier character, and then the neighbour must not be one.
pub fn word_bounded(text: &str, start: usize, end: usize) -> bool {
    let matched = &text[start..end];

    let left_ok = match matched.chars().next() {
        Some(first) if is_ident_char(first) => {
            !char_before(text, start).is_some_and(is_ident_char)
        }
        _ => true,
    };

    let right_ok = match matched.chars().next_back() {
        Some(last) if is_ident_char(last) => !char_after(text, end).is_some_and(is_ident_char),
        _ => true,
    };

    left_ok && right_ok
}

// ============================================================================
// Quote automaton
// ============================================================================

/// Scan single- and double-quoted literals with `\` escapes.
///
/// A newline ends a literal as unterminated; a literal still open at end of
/// text is unterminated too.
pub fn literal_regions(text: &str) -> Vec<LiteralRegion> {
    let bytes = text.as_bytes();
    let mut regions = Vec::new();
    let mut open: Option<(usize, u8)> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match open {
            None => {
                if b == b'\'' || b == b'"' {
                    open = Some((i + 1, b));
                }
                i += 1;
            }
            Some((start, quote)) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == quote || b == b'\n' {
                    regions.push(LiteralRegion {
                        start,
                        end: i,
                        quote: quote as char,
                        terminated: b == quote,
                    });
                    open = None;
                }
                i += 1;
            }
        }
    }

    if let Some((start, quote)) = open {
        regions.push(LiteralRegion {
            start,
            end: bytes.len(),
            quote: quote as char,
            terminated: false,
        });
    }

    regions
}

fn region_containing(regions: &[LiteralRegion], start: usize, end: usize) -> Option<&LiteralRegion> {
    let idx = regions.partition_point(|r| r.start <= start);
    idx.checked_sub(1)
        .map(|i| &regions[i])
        .filter(|r| r.contains(start, end))
}

// ============================================================================
// Matching
// ============================================================================

fn judge(text: &str, start: usize, end: usize, boundary: Boundary, regions: &[LiteralRegion]) -> Verdict {
    match boundary {
        Boundary::FreeText => Verdict::Accept,
        Boundary::Word => {
            if word_bounded(text, start, end) {
                Verdict::Accept
            } else {
                Verdict::Reject
            }
        }
        Boundary::StringLiteral => match region_containing(regions, start, end) {
            None => Verdict::Reject,
            Some(region) if !region.terminated => {
                Verdict::Ambiguous(AmbiguityReason::UnterminatedLiteral)
            }
            Some(_) if word_bounded(text, start, end) => Verdict::Accept,
            Some(_) => Verdict::Reject,
        },
    }
}

/// Find accepted, non-overlapping matches of `matcher` in `text`.
///
/// After a rejected candidate the scan resumes one character later, so a
/// rejected long candidate never hides a valid shorter one behind it.
pub fn find_matches(text: &str, matcher: &Matcher, rule_id: &str) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let regions = match matcher.boundary {
        Boundary::StringLiteral => literal_regions(text),
        _ => Vec::new(),
    };
    let bounded = matcher.boundary != Boundary::FreeText;

    let mut pos = 0;
    let mut last_end: Option<usize> = None;

    while pos <= text.len() {
        let Some(caps) = matcher.regex().captures_at(text, pos) else {
            break;
        };
        let Some(whole) = caps.get(0) else {
            break;
        };
        let (start, end) = (whole.start(), whole.end());

        if start == end {
            outcome.ambiguities.push(BoundaryAmbiguity {
                rule_id: rule_id.to_string(),
                start,
                end,
                reason: AmbiguityReason::ZeroWidth,
            });
            pos = next_char_boundary(text, end);
            continue;
        }

        match judge(text, start, end, matcher.boundary, &regions) {
            Verdict::Accept if bounded && last_end == Some(start) => {
                outcome.ambiguities.push(BoundaryAmbiguity {
                    rule_id: rule_id.to_string(),
                    start,
                    end,
                    reason: AmbiguityReason::AbutsPreviousMatch,
                });
                pos = next_char_boundary(text, start);
            }
            Verdict::Accept => {
                outcome.spans.push(MatchSpan {
                    start,
                    end,
                    rule_id: rule_id.to_string(),
                    captured_groups: caps
                        .iter()
                        .map(|g| g.map(|m| m.as_str().to_string()))
                        .collect(),
                });
                last_end = Some(end);
                pos = end;
            }
            Verdict::Reject => {
                pos = next_char_boundary(text, start);
            }
            Verdict::Ambiguous(reason) => {
                outcome.ambiguities.push(BoundaryAmbiguity {
                    rule_id: rule_id.to_string(),
                    start,
                    end,
                    reason,
                });
                pos = next_char_boundary(text, start);
            }
        }
    }

    outcome
}

/// 1-based line number of a byte offset.
pub fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}
