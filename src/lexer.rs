//! Tokenizer: raw text to a vector of classified, located tokens.
//!
//! Individual lexemes are recognized with `nom` combinators; the driver loop
//! skips whitespace and comments, stamps each token with its
//! [`SourceLocation`] and turns nom failures into [`SyntaxError`]s.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{anychar, char, multispace0, not_line_ending},
    combinator::{cut, map, value},
    error::ErrorKind,
};

use crate::syntax::SourceLocation;
use crate::{Error, ParseConfig, SyntaxError, SyntaxErrorKind};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    Round,
    Square,
}

impl Bracket {
    pub fn open_char(self) -> char {
        match self {
            Bracket::Round => '(',
            Bracket::Square => '[',
        }
    }

    pub fn close_char(self) -> char {
        match self {
            Bracket::Round => ')',
            Bracket::Square => ']',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Open(Bracket),
    Close(Bracket),
    /// `#(`, closed by a round bracket
    OpenVector,
    Dot,
    Quote,
    Quasiquote,
    Unquote,
    UnquoteSplicing,
    /// `#;` - the parser discards the next datum
    DatumComment,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Character(char),
    String(String),
    Symbol(String),
    /// `:name`, kept with its colon
    Keyword(String),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Open(b) => write!(f, "'{}'", b.open_char()),
            TokenKind::Close(b) => write!(f, "'{}'", b.close_char()),
            TokenKind::OpenVector => write!(f, "'#('"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::Quote => write!(f, "'''"),
            TokenKind::Quasiquote => write!(f, "'`'"),
            TokenKind::Unquote => write!(f, "','"),
            TokenKind::UnquoteSplicing => write!(f, "',@'"),
            TokenKind::DatumComment => write!(f, "'#;'"),
            TokenKind::Boolean(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            TokenKind::Integer(n) => write!(f, "{n}"),
            TokenKind::Float(x) => write!(f, "{x}"),
            TokenKind::Character(c) => write!(f, "#\\{c}"),
            TokenKind::String(s) => write!(f, "{s:?}"),
            TokenKind::Symbol(s) | TokenKind::Keyword(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: SourceLocation,
}

/// Byte offsets of line starts, for turning offsets into line/column pairs
struct LineIndex<'s> {
    source: &'s str,
    origin: Rc<str>,
    starts: Vec<usize>,
}

impl<'s> LineIndex<'s> {
    fn new(source: &'s str, origin: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        LineIndex {
            source,
            origin: Rc::from(origin),
            starts,
        }
    }

    fn locate(&self, offset: usize) -> SourceLocation {
        let line = self
            .starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let line_start = self.starts.get(line).copied().unwrap_or(0);
        let column = self
            .source
            .get(line_start..offset)
            .map_or(0, |text| text.chars().count());
        SourceLocation {
            origin: Rc::clone(&self.origin),
            line: u32::try_from(line + 1).unwrap_or(u32::MAX),
            column: u32::try_from(column + 1).unwrap_or(u32::MAX),
            offset,
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '"' | ';')
}

fn at_delimiter(input: &str) -> bool {
    input.chars().next().is_none_or(is_delimiter)
}

fn reject<T>(input: &str, kind: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Error(nom::error::Error::new(input, kind)))
}

/// Like `reject`, but stops `alt` from trying other lexemes
fn fail<T>(input: &str, kind: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Failure(nom::error::Error::new(input, kind)))
}

/// Brackets and the quote family
fn parse_punctuation(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::Open(Bracket::Round), char('(')),
        value(TokenKind::Open(Bracket::Square), char('[')),
        value(TokenKind::Close(Bracket::Round), char(')')),
        value(TokenKind::Close(Bracket::Square), char(']')),
        value(TokenKind::OpenVector, tag("#(")),
        value(TokenKind::DatumComment, tag("#;")),
        value(TokenKind::Quote, char('\'')),
        value(TokenKind::Quasiquote, char('`')),
        value(TokenKind::UnquoteSplicing, tag(",@")),
        value(TokenKind::Unquote, char(',')),
    ))
    .parse(input)
}

/// Parse a string literal; `ErrorKind::Eof` marks an unterminated string,
/// `ErrorKind::Escaped` a bad escape sequence
fn parse_string(input: &str) -> IResult<&str, TokenKind> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut text = String::new();

    loop {
        let mut chars = remaining.chars();
        match chars.next() {
            Some('"') => return Ok((chars.as_str(), TokenKind::String(text))),
            Some('\\') => {
                match chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(_) => return fail(remaining, ErrorKind::Escaped),
                    None => return fail(remaining, ErrorKind::Eof),
                }
                remaining = chars.as_str();
            }
            Some(c) => {
                text.push(c);
                remaining = chars.as_str();
            }
            None => return fail(remaining, ErrorKind::Eof),
        }
    }
}

/// Parse `#t`, `#f`, `#true` or `#false`
fn parse_boolean(input: &str) -> IResult<&str, TokenKind> {
    let (rest, b) = alt((
        value(true, tag("#true")),
        value(false, tag("#false")),
        value(true, tag("#t")),
        value(false, tag("#f")),
    ))
    .parse(input)?;
    if !at_delimiter(rest) {
        return reject(input, ErrorKind::Tag);
    }
    Ok((rest, TokenKind::Boolean(b)))
}

/// Parse a hexadecimal integer (#x or #X prefix, optional sign)
fn parse_hexadecimal(input: &str) -> IResult<&str, TokenKind> {
    let (rest, _) = alt((tag("#x"), tag("#X"))).parse(input)?;
    let (rest, sign) = alt((value(-1, char('-')), value(1, char('+')), value(1, tag(""))))
        .parse(rest)?;
    let (rest, digits) = cut(take_while1(|c: char| c.is_ascii_hexdigit())).parse(rest)?;
    if !at_delimiter(rest) {
        return fail(input, ErrorKind::HexDigit);
    }
    match i64::from_str_radix(digits, 16) {
        Ok(n) => Ok((rest, TokenKind::Integer(sign * n))),
        Err(_) => fail(input, ErrorKind::TooLarge),
    }
}

/// Parse `#\a`, `#\space`, `#\x41` and friends
fn parse_character(input: &str) -> IResult<&str, TokenKind> {
    let (rest, _) = tag("#\\").parse(input)?;
    let (rest, first) = cut(anychar).parse(rest)?;
    let (rest, tail) = take_while(|c: char| !is_delimiter(c)).parse(rest)?;
    if tail.is_empty() {
        return Ok((rest, TokenKind::Character(first)));
    }

    let name = format!("{first}{tail}");
    let named = match name.as_str() {
        "space" => Some(' '),
        "newline" | "linefeed" => Some('\n'),
        "tab" => Some('\t'),
        "return" => Some('\r'),
        "nul" | "null" => Some('\0'),
        "alarm" => Some('\u{7}'),
        "backspace" => Some('\u{8}'),
        "delete" => Some('\u{7f}'),
        "escape" => Some('\u{1b}'),
        _ if first == 'x' => u32::from_str_radix(tail, 16).ok().and_then(char::from_u32),
        _ => None,
    };
    match named {
        Some(c) => Ok((rest, TokenKind::Character(c))),
        None => fail(input, ErrorKind::Char),
    }
}

fn parse_hash_literal(input: &str) -> IResult<&str, TokenKind> {
    alt((parse_hexadecimal, parse_boolean, parse_character)).parse(input)
}

/// Symbols and numbers share one lexeme shape; they are told apart afterwards
fn parse_atom(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !is_delimiter(c) && !matches!(c, '\'' | '`' | ',')).parse(input)
}

enum Lexeme<'a> {
    Token(TokenKind),
    Atom(&'a str),
}

fn parse_lexeme(input: &str) -> IResult<&str, Lexeme<'_>> {
    alt((
        map(parse_punctuation, Lexeme::Token),
        map(parse_string, Lexeme::Token),
        map(parse_hash_literal, Lexeme::Token),
        map(parse_atom, Lexeme::Atom),
    ))
    .parse(input)
}

fn looks_numeric(text: &str) -> bool {
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    let unsigned = unsigned.strip_prefix('.').unwrap_or(unsigned);
    unsigned.starts_with(|c: char| c.is_ascii_digit())
}

fn classify_atom(text: &str) -> Result<TokenKind, SyntaxError> {
    if text == "." {
        return Ok(TokenKind::Dot);
    }
    if looks_numeric(text) {
        if let Ok(n) = text.parse::<i64>() {
            return Ok(TokenKind::Integer(n));
        }
        let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
        if unsigned.chars().all(|c| c.is_ascii_digit()) {
            return Err(SyntaxError::new(
                SyntaxErrorKind::ImplementationLimit,
                "integer literal out of range",
            ));
        }
        return text
            .parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| SyntaxError::new(SyntaxErrorKind::InvalidSyntax, "malformed number"));
    }
    if text.starts_with('#') {
        return Err(SyntaxError::new(
            SyntaxErrorKind::InvalidSyntax,
            "unrecognized token",
        ));
    }
    if text.len() > 1 && text.starts_with(':') {
        return Ok(TokenKind::Keyword(text.to_owned()));
    }
    Ok(TokenKind::Symbol(text.to_owned()))
}

/// Skip whitespace, `;` line comments and nested `#| |#` block comments
fn skip_atmosphere<'a>(input: &'a str, config: &ParseConfig) -> Result<&'a str, SyntaxError> {
    let mut rest = input;
    loop {
        let (after_space, _) = multispace0::<&str, nom::error::Error<&str>>(rest)
            .map_err(|_| SyntaxError::new(SyntaxErrorKind::InvalidSyntax, "bad whitespace"))?;
        rest = after_space;

        let is_line_comment = rest.starts_with(';');
        let is_block_comment = rest.starts_with("#|");
        if (is_line_comment || is_block_comment) && !config.handle_comments {
            return Err(SyntaxError::new(
                SyntaxErrorKind::InvalidSyntax,
                "comments are not enabled",
            ));
        }

        if is_line_comment {
            let (after_comment, _) = not_line_ending::<&str, nom::error::Error<&str>>(rest)
                .map_err(|_| {
                    SyntaxError::new(SyntaxErrorKind::InvalidSyntax, "malformed line ending")
                })?;
            rest = after_comment;
        } else if is_block_comment {
            rest = skip_block_comment(rest)?;
        } else {
            return Ok(rest);
        }
    }
}

fn skip_block_comment(input: &str) -> Result<&str, SyntaxError> {
    let mut depth = 0usize;
    let mut rest = input;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("#|") {
            depth += 1;
            rest = after;
        } else if let Some(after) = rest.strip_prefix("|#") {
            depth -= 1;
            rest = after;
            if depth == 0 {
                return Ok(rest);
            }
        } else {
            let mut chars = rest.chars();
            chars.next();
            rest = chars.as_str();
        }
    }
    Err(SyntaxError::new(
        SyntaxErrorKind::Incomplete,
        "unterminated block comment",
    ))
}

fn lexeme_error(rest: &str, error: nom::Err<nom::error::Error<&str>>) -> SyntaxError {
    let found: String = rest.chars().take_while(|c| !c.is_whitespace()).take(20).collect();
    let (kind, message) = match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => match e.code {
            ErrorKind::Eof => (SyntaxErrorKind::Incomplete, "unterminated string literal"),
            ErrorKind::Escaped => (SyntaxErrorKind::InvalidSyntax, "unknown escape sequence"),
            ErrorKind::TooLarge => (
                SyntaxErrorKind::ImplementationLimit,
                "integer literal out of range",
            ),
            ErrorKind::HexDigit => (SyntaxErrorKind::InvalidSyntax, "malformed hexadecimal literal"),
            ErrorKind::Char => (SyntaxErrorKind::InvalidSyntax, "unknown character name"),
            _ => (SyntaxErrorKind::InvalidSyntax, "unrecognized token"),
        },
        nom::Err::Incomplete(_) => (SyntaxErrorKind::Incomplete, "incomplete input"),
    };
    SyntaxError::new(kind, message).found(found)
}

/// Tokenize a whole source text.
pub fn tokenize(source: &str, origin: &str, config: &ParseConfig) -> Result<Vec<Token>, Error> {
    let index = LineIndex::new(source, origin);
    let offset_of = |rest: &str| source.len() - rest.len();
    let mut tokens = Vec::new();
    let mut rest = source;

    loop {
        rest = skip_atmosphere(rest, config)
            .map_err(|e| e.at(Some(&index.locate(offset_of(rest)))))?;
        if rest.is_empty() {
            break;
        }

        let location = index.locate(offset_of(rest));
        let (remaining, lexeme) =
            parse_lexeme(rest).map_err(|e| lexeme_error(rest, e).at(Some(&location)))?;
        let kind = match lexeme {
            Lexeme::Token(TokenKind::DatumComment) if !config.handle_comments => {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::InvalidSyntax,
                    "comments are not enabled",
                )
                .at(Some(&location))
                .into());
            }
            Lexeme::Token(kind) => kind,
            Lexeme::Atom(text) => {
                classify_atom(text).map_err(|e| e.found(text).at(Some(&location)))?
            }
        };
        tokens.push(Token { kind, location });
        rest = remaining;
    }

    Ok(tokens)
}
