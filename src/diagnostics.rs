//! Diagnostic side table (§4.2 "a message index into a side table so the
//! AST carries no message strings", §6 "diagnostics carry a location and
//! a message index into a side table").

use crate::ast::MessageId;
use crate::source::SourceSpan;
use itertools::Itertools;

/// Severity of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One diagnostic: a rendered message plus the span it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: SourceSpan,
}

/// Accumulates diagnostics during parsing; AST error nodes reference an
/// entry here by index rather than embedding message strings inline,
/// keeping node sizes and allocations out of the hot parse path.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic, returning its [`MessageId`].
    pub fn push(&mut self, severity: Severity, message: impl Into<String>, span: SourceSpan) -> MessageId {
        self.entries.push(Diagnostic {
            severity,
            message: message.into(),
            span,
        });
        (self.entries.len() - 1) as MessageId
    }

    /// Record an error-severity diagnostic.
    pub fn error(&mut self, message: impl Into<String>, span: SourceSpan) -> MessageId {
        self.push(Severity::Error, message, span)
    }

    /// Look up a previously recorded diagnostic by id.
    pub fn get(&self, id: MessageId) -> Option<&Diagnostic> {
        self.entries.get(id as usize)
    }

    /// All recorded diagnostics, in recording order.
    pub fn all(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// True if any error-severity diagnostic was recorded.
    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    /// One line per diagnostic, in recording order, for an embedder that
    /// wants a plain-text report rather than walking `all()` itself.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|d| format!("{:?} {}:{}: {}", d.severity, d.span.start.line, d.span.start.column, d.message))
            .join("\n")
    }
}
