//! Recursive-descent parser from tokens to [`Syntax`] trees.
//!
//! Quote-family tokens desugar to two-element lists headed by `quote`,
//! `quasiquote`, `unquote` or `unquote-splicing`. A single interior dot
//! produces a [`SyntaxDatum::DottedList`]; a dotted tail that is itself a list
//! is spliced, so `(a . (b c))` parses exactly like `(a b c)`.

use crate::lexer::{Bracket, Token, TokenKind};
use crate::syntax::{SourceLocation, Syntax, SyntaxDatum};
use crate::value::Value;
use crate::{Error, ParseConfig, SyntaxError, SyntaxErrorKind};
use std::rc::Rc;

struct Parser<'t> {
    tokens: &'t [Token],
    position: usize,
    max_depth: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token], config: &ParseConfig) -> Self {
        Parser {
            tokens,
            position: 0,
            max_depth: config.max_depth,
        }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    fn at_end(&self) -> bool {
        self.position >= self.tokens.len()
    }

    fn end_of_input(&self, opened_at: Option<&SourceLocation>, what: &str) -> Error {
        let location = opened_at.or_else(|| self.tokens.last().map(|t| &t.location));
        SyntaxError::new(
            SyntaxErrorKind::Incomplete,
            format!("unexpected end of input in {what}"),
        )
        .at(location)
        .into()
    }

    /// Discard any `#;` comments and the datums they cover
    fn skip_datum_comments(&mut self, depth: usize) -> Result<(), Error> {
        while let Some(token) = self.peek()
            && token.kind == TokenKind::DatumComment
        {
            self.position += 1;
            self.datum(depth)?;
        }
        Ok(())
    }

    fn datum(&mut self, depth: usize) -> Result<Syntax, Error> {
        if depth >= self.max_depth {
            let location = self.peek().map(|t| &t.location);
            return Err(SyntaxError::new(
                SyntaxErrorKind::TooDeeplyNested,
                format!("expression too deeply nested (max depth: {})", self.max_depth),
            )
            .at(location)
            .into());
        }

        self.skip_datum_comments(depth + 1)?;
        let Some(token) = self.next() else {
            return Err(self.end_of_input(None, "datum"));
        };
        let location = Some(token.location.clone());

        let datum = match &token.kind {
            TokenKind::Open(bracket) => return self.list(*bracket, &token.location, depth),
            TokenKind::OpenVector => return self.vector(&token.location, depth),
            TokenKind::Close(bracket) => {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::Unbalanced,
                    format!("unexpected '{}'", bracket.close_char()),
                )
                .at(location.as_ref())
                .into());
            }
            TokenKind::Dot => {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::InvalidSyntax,
                    "'.' is only allowed before the last datum of a list",
                )
                .at(location.as_ref())
                .into());
            }
            TokenKind::Quote => return self.quoted("quote", &token.location, depth),
            TokenKind::Quasiquote => return self.quoted("quasiquote", &token.location, depth),
            TokenKind::Unquote => return self.quoted("unquote", &token.location, depth),
            TokenKind::UnquoteSplicing => {
                return self.quoted("unquote-splicing", &token.location, depth);
            }
            TokenKind::DatumComment => {
                // skip_datum_comments consumed every leading comment
                return Err(self.end_of_input(location.as_ref(), "datum comment"));
            }
            TokenKind::Boolean(b) => SyntaxDatum::Literal(Value::Bool(*b)),
            TokenKind::Integer(n) => SyntaxDatum::Literal(Value::Integer(*n)),
            TokenKind::Float(x) => SyntaxDatum::Literal(Value::Float(*x)),
            TokenKind::Character(c) => SyntaxDatum::Literal(Value::Char(*c)),
            TokenKind::String(s) => SyntaxDatum::Literal(Value::string(s)),
            TokenKind::Keyword(k) => SyntaxDatum::Literal(Value::symbol(k)),
            TokenKind::Symbol(s) => SyntaxDatum::Identifier(Rc::from(s.as_str())),
        };
        Ok(Syntax::new(datum, location))
    }

    fn quoted(
        &mut self,
        keyword: &str,
        location: &SourceLocation,
        depth: usize,
    ) -> Result<Syntax, Error> {
        if self.at_end() {
            return Err(self.end_of_input(Some(location), keyword));
        }
        let quoted = self.datum(depth + 1)?;
        let head = Syntax::new(
            SyntaxDatum::Identifier(Rc::from(keyword)),
            Some(location.clone()),
        );
        Ok(Syntax::new(
            SyntaxDatum::List(vec![head, quoted]),
            Some(location.clone()),
        ))
    }

    fn list(
        &mut self,
        bracket: Bracket,
        opened_at: &SourceLocation,
        depth: usize,
    ) -> Result<Syntax, Error> {
        let mut items = Vec::new();
        loop {
            self.skip_datum_comments(depth + 1)?;
            let Some(token) = self.peek() else {
                return Err(self.end_of_input(
                    Some(opened_at),
                    &format!("list opened with '{}'", bracket.open_char()),
                ));
            };

            match &token.kind {
                TokenKind::Close(closer) => {
                    self.position += 1;
                    self.expect_matching(bracket, *closer, &token.location)?;
                    return Ok(Syntax::new(SyntaxDatum::List(items), Some(opened_at.clone())));
                }
                TokenKind::Dot => {
                    self.position += 1;
                    if items.is_empty() {
                        return Err(SyntaxError::new(
                            SyntaxErrorKind::InvalidSyntax,
                            "'.' must follow at least one datum",
                        )
                        .at(Some(&token.location))
                        .into());
                    }
                    let tail = self.dotted_tail(bracket, opened_at, &token.location, depth)?;
                    return Ok(Syntax::new(
                        Self::join_dotted(items, tail),
                        Some(opened_at.clone()),
                    ));
                }
                _ => items.push(self.datum(depth + 1)?),
            }
        }
    }

    /// Parse the single datum after a dot and the closing bracket after it
    fn dotted_tail(
        &mut self,
        bracket: Bracket,
        opened_at: &SourceLocation,
        dot_at: &SourceLocation,
        depth: usize,
    ) -> Result<Syntax, Error> {
        self.skip_datum_comments(depth + 1)?;
        match self.peek().map(|t| &t.kind) {
            None => {
                return Err(self.end_of_input(Some(opened_at), "dotted list"));
            }
            Some(TokenKind::Close(_) | TokenKind::Dot) => {
                return Err(SyntaxError::new(
                    SyntaxErrorKind::InvalidSyntax,
                    "expected a datum after '.'",
                )
                .at(Some(dot_at))
                .into());
            }
            Some(_) => {}
        }
        let tail = self.datum(depth + 1)?;

        self.skip_datum_comments(depth + 1)?;
        match self.next() {
            Some(Token {
                kind: TokenKind::Close(closer),
                location,
            }) => {
                self.expect_matching(bracket, *closer, location)?;
                Ok(tail)
            }
            Some(token) => Err(SyntaxError::new(
                SyntaxErrorKind::InvalidSyntax,
                "exactly one datum may follow '.'",
            )
            .at(Some(&token.location))
            .found(token.kind.to_string())
            .into()),
            None => Err(self.end_of_input(Some(opened_at), "dotted list")),
        }
    }

    fn join_dotted(mut items: Vec<Syntax>, tail: Syntax) -> SyntaxDatum {
        match tail.datum() {
            SyntaxDatum::List(rest) => {
                items.extend(rest.iter().cloned());
                SyntaxDatum::List(items)
            }
            SyntaxDatum::DottedList(rest, last) => {
                items.extend(rest.iter().cloned());
                SyntaxDatum::DottedList(items, last.clone())
            }
            _ => SyntaxDatum::DottedList(items, tail),
        }
    }

    fn expect_matching(
        &self,
        opened: Bracket,
        closed: Bracket,
        location: &SourceLocation,
    ) -> Result<(), Error> {
        if opened == closed {
            return Ok(());
        }
        Err(SyntaxError::new(
            SyntaxErrorKind::Unbalanced,
            format!(
                "'{}' closed by mismatched '{}'",
                opened.open_char(),
                closed.close_char()
            ),
        )
        .at(Some(location))
        .into())
    }

    fn vector(&mut self, opened_at: &SourceLocation, depth: usize) -> Result<Syntax, Error> {
        let mut items = Vec::new();
        loop {
            self.skip_datum_comments(depth + 1)?;
            let Some(token) = self.peek() else {
                return Err(self.end_of_input(Some(opened_at), "vector"));
            };
            match &token.kind {
                TokenKind::Close(closer) => {
                    self.position += 1;
                    self.expect_matching(Bracket::Round, *closer, &token.location)?;
                    return Ok(Syntax::new(
                        SyntaxDatum::Vector(items),
                        Some(opened_at.clone()),
                    ));
                }
                TokenKind::Dot => {
                    return Err(SyntaxError::new(
                        SyntaxErrorKind::InvalidSyntax,
                        "'.' is not allowed in a vector",
                    )
                    .at(Some(&token.location))
                    .into());
                }
                _ => items.push(self.datum(depth + 1)?),
            }
        }
    }
}

/// Parse exactly one datum; anything after it is an error.
pub fn parse(tokens: &[Token]) -> Result<Syntax, Error> {
    let mut parser = Parser::new(tokens, &ParseConfig::default());
    let datum = parser.datum(0)?;
    parser.skip_datum_comments(1)?;
    if let Some(token) = parser.peek() {
        return Err(SyntaxError::new(
            SyntaxErrorKind::InvalidSyntax,
            "unexpected input after datum",
        )
        .at(Some(&token.location))
        .found(token.kind.to_string())
        .into());
    }
    Ok(datum)
}

/// Parse every top-level datum of a compile unit.
pub fn parse_program(tokens: &[Token], config: &ParseConfig) -> Result<Vec<Syntax>, Error> {
    let mut parser = Parser::new(tokens, config);
    let mut forms = Vec::new();
    loop {
        parser.skip_datum_comments(1)?;
        if parser.at_end() {
            return Ok(forms);
        }
        forms.push(parser.datum(0)?);
    }
}
