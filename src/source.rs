//! Source locations carried on every token and AST node (§3 "Source
//! location").

use core::fmt;

/// A single position in source text: 1-based line and column. CRLF line
/// endings are normalized to LF before column/line tracking begins (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SourcePos {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl SourcePos {
    /// The position at the very start of a buffer.
    pub const fn start() -> Self {
        Self { line: 1, column: 1 }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A half-open range of source positions, carried on every token and AST
/// node for diagnostics (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceSpan {
    /// Inclusive start position.
    pub start: SourcePos,
    /// Exclusive end position.
    pub end: SourcePos,
}

impl SourceSpan {
    /// Construct a span from a start/end pair.
    pub const fn new(start: SourcePos, end: SourcePos) -> Self {
        Self { start, end }
    }

    /// A zero-width span at a single position, used for synthesized nodes
    /// (e.g. sugared `function name(...)` declarations).
    pub const fn point(pos: SourcePos) -> Self {
        Self {
            start: pos,
            end: pos,
        }
    }

    /// Merge two spans into the smallest span covering both.
    pub fn merge(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
