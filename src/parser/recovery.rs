//! Error recovery: advance past a malformed region using a
//! synchronization set of statement-terminating tokens, block keywords,
//! and end-of-file (§4.2).

use super::Parser;
use crate::lexer::{Keyword, TokenKind};

impl<'a> Parser<'a> {
    /// Advance tokens until one in the synchronization set is reached,
    /// without consuming it. Always makes progress (advances at least one
    /// token) so the parser cannot loop forever on a malformed prefix.
    pub(super) fn recover_to_sync(&mut self) {
        if self.at_sync_point() {
            self.bump();
        }
        while !self.at_sync_point() {
            self.bump();
        }
    }

    fn at_sync_point(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Eof
                | TokenKind::Punct(';')
                | TokenKind::Keyword(Keyword::End)
                | TokenKind::Keyword(Keyword::Else)
                | TokenKind::Keyword(Keyword::Elif)
                | TokenKind::Keyword(Keyword::Until)
                | TokenKind::Keyword(Keyword::Then)
                | TokenKind::Keyword(Keyword::Do)
                | TokenKind::Keyword(Keyword::If)
                | TokenKind::Keyword(Keyword::While)
                | TokenKind::Keyword(Keyword::For)
                | TokenKind::Keyword(Keyword::Return)
                | TokenKind::Keyword(Keyword::Local)
                | TokenKind::Keyword(Keyword::Function)
                | TokenKind::Keyword(Keyword::Break)
                | TokenKind::Keyword(Keyword::Continue)
        )
    }
}
