// Lexer for trace scripts (`.tts` files).
//
// Uses the `logos` crate for DFA-based lexing. Newlines are significant
// (statement terminators); `#` starts a comment that runs to end of line.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Trace script token types.
///
/// Identifiers carry no value; use the span to retrieve the text from the
/// source. Numbers are unsigned (a leading `-` is the negation operator).
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+|#[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("fn")]
    Fn,
    #[token("let")]
    Let,
    #[token("return")]
    Return,
    #[token("as")]
    As,

    // ── Operators ──
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("@")]
    At,
    #[token("^")]
    Caret,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,

    // ── Punctuation ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Equals,

    // ── Literals ──
    /// Integer literal; also used for shapes and axes.
    #[regex(r"[0-9]+", parse_int)]
    Int(usize),

    /// Decimal literal with a fraction or exponent.
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?|[0-9]+[eE][+-]?[0-9]+", parse_float)]
    Float(f64),

    // ── Identifier ──
    //
    // logos prefers the fixed `#[token]` keywords over this regex for
    // matches of the same length, so `fn` is Fn and `fnx` is Ident.
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // ── Structure ──
    #[regex(r"\n+")]
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Fn => write!(f, "fn"),
            Token::Let => write!(f, "let"),
            Token::Return => write!(f, "return"),
            Token::As => write!(f, "as"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::At => write!(f, "@"),
            Token::Caret => write!(f, "^"),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Equals => write!(f, "="),
            Token::Int(v) => write!(f, "{v}"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Ident => write!(f, "<ident>"),
            Token::Newline => write!(f, "<newline>"),
        }
    }
}

// ── Callbacks ──

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<usize> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

// ── Public API ──

/// Lex a trace script into tokens.
///
/// Returns all successfully parsed tokens together with any errors for
/// unrecognised characters (or integers too large for `usize`). Lexing is
/// non-fatal: errors are collected and the lexer continues.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected input: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    fn lex_all(source: &str) -> (Vec<Token>, Vec<LexError>) {
        let result = lex(source);
        let tokens = result.tokens.into_iter().map(|(t, _)| t).collect();
        (tokens, result.errors)
    }

    // ── Keywords ──

    #[test]
    fn keywords() {
        let tokens = lex_ok("fn let return as");
        assert_eq!(tokens, vec![Token::Fn, Token::Let, Token::Return, Token::As]);
    }

    #[test]
    fn keyword_vs_ident() {
        // `lets` and `fnx` are identifiers, not keyword + suffix
        let tokens = lex_ok("lets fnx assign");
        assert_eq!(tokens, vec![Token::Ident, Token::Ident, Token::Ident]);
    }

    // ── Operators ──

    #[test]
    fn operators() {
        let tokens = lex_ok("+ - * / @ ^");
        assert_eq!(
            tokens,
            vec![
                Token::Plus,
                Token::Minus,
                Token::Star,
                Token::Slash,
                Token::At,
                Token::Caret,
            ]
        );
    }

    #[test]
    fn comparisons_prefer_longest_match() {
        let tokens = lex_ok("< <= > >= == != =");
        assert_eq!(
            tokens,
            vec![
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::EqEq,
                Token::Ne,
                Token::Equals,
            ]
        );
    }

    #[test]
    fn punctuation() {
        let tokens = lex_ok("( ) { } [ ] , :");
        assert_eq!(
            tokens,
            vec![
                Token::LParen,
                Token::RParen,
                Token::LBrace,
                Token::RBrace,
                Token::LBracket,
                Token::RBracket,
                Token::Comma,
                Token::Colon,
            ]
        );
    }

    // ── Number literals ──

    #[test]
    fn integer() {
        assert_eq!(lex_ok("42"), vec![Token::Int(42)]);
    }

    #[test]
    fn float_fraction_and_exponent() {
        assert_eq!(
            lex_ok("3.25 1e3 2.5E-1"),
            vec![Token::Float(3.25), Token::Float(1000.0), Token::Float(0.25)]
        );
    }

    #[test]
    fn minus_is_never_part_of_a_number() {
        assert_eq!(lex_ok("-2"), vec![Token::Minus, Token::Int(2)]);
    }

    #[test]
    fn integer_overflow_is_an_error() {
        let (_, errors) = lex_all("99999999999999999999999999");
        assert_eq!(errors.len(), 1);
    }

    // ── Structure ──

    #[test]
    fn newlines_collapse() {
        assert_eq!(
            lex_ok("x\n\n\ny"),
            vec![Token::Ident, Token::Newline, Token::Ident]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            lex_ok("x # the input\ny"),
            vec![Token::Ident, Token::Newline, Token::Ident]
        );
    }

    #[test]
    fn spans_are_byte_offsets() {
        let result = lex("let zz = 1");
        let spans: Vec<(usize, usize)> = result
            .tokens
            .iter()
            .map(|(_, s)| (s.start, s.end))
            .collect();
        assert_eq!(spans, vec![(0, 3), (4, 6), (7, 8), (9, 10)]);
    }

    // ── Errors ──

    #[test]
    fn unknown_character_continues() {
        let (tokens, errors) = lex_all("x $ y");
        assert_eq!(tokens, vec![Token::Ident, Token::Ident]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].span, Span { start: 2, end: 3 });
    }
}
