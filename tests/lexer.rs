use script_vm::lexer::{Keyword, Lexer, Symbol, TokenKind};

fn kinds(source: &str) -> Vec<TokenKind> {
    let mut lexer = Lexer::new(source);
    let mut out = Vec::new();
    loop {
        let tok = lexer.next();
        let is_eof = tok.is_eof();
        out.push(tok.kind);
        if is_eof {
            break;
        }
    }
    out
}

#[test]
fn keywords_are_recognized_by_exact_spelling() {
    let kinds = kinds("local elif null repeat until and or not");
    assert_eq!(
        kinds,
        vec![
            TokenKind::Keyword(Keyword::Local),
            TokenKind::Keyword(Keyword::Elif),
            TokenKind::Keyword(Keyword::Null),
            TokenKind::Keyword(Keyword::Repeat),
            TokenKind::Keyword(Keyword::Until),
            TokenKind::Keyword(Keyword::And),
            TokenKind::Keyword(Keyword::Or),
            TokenKind::Keyword(Keyword::Not),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn an_identifier_that_is_not_a_keyword_lexes_as_a_name() {
    let kinds = kinds("elifish");
    match &kinds[0] {
        TokenKind::Name(n) => assert_eq!(&**n, "elifish"),
        other => panic!("expected a Name token, got {other:?}"),
    }
}

#[test]
fn compound_symbols_win_over_their_single_character_prefix() {
    let kinds = kinds("+= == <= ..");
    assert_eq!(
        kinds,
        vec![
            TokenKind::Symbol(Symbol::PlusEq),
            TokenKind::Symbol(Symbol::Eq),
            TokenKind::Symbol(Symbol::Le),
            TokenKind::Punct('.'),
            TokenKind::Punct('.'),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn decimal_and_hex_numbers_decode_to_the_same_value() {
    let kinds = kinds("0x10 16");
    match (&kinds[0], &kinds[1]) {
        (TokenKind::Number(a), TokenKind::Number(b)) => assert_eq!(a, b),
        other => panic!("expected two Number tokens, got {other:?}"),
    }
}

#[test]
fn an_unterminated_string_lexes_as_broken_rather_than_failing() {
    let mut lexer = Lexer::new("\"unterminated");
    let tok = lexer.next();
    assert!(matches!(tok.kind, TokenKind::Broken(_)));
}

#[test]
fn line_comments_are_skipped_like_whitespace() {
    let kinds = kinds("-- a comment\n1");
    assert_eq!(kinds, vec![TokenKind::Number(1.0), TokenKind::Eof]);
}
