#![allow(clippy::module_name_repetitions)]

//! Lexer and parser for the port console.
//!
//! `regal` turns a line into a bounded token buffer and `winnow` combinators
//! over that buffer build a [`Command`]. Keywords match case-insensitively.

use core::fmt;
use core::ops::Range;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
#[allow(deprecated)]
use winnow::error::ErrorKind;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::stream::Stream;

use super::catalog::{self, CommandTag};
use crate::hv::Voltage;
use crate::water::{ThresholdKey, WaterSensitivity};

/// Maximum number of tokens in one console line.
pub const MAX_TOKENS: usize = 16;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Lexical token kinds.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    #[regex(r"[0-9]+")]
    Integer,
    /// Keyword or threshold name.
    #[regex(r"[A-Za-z][A-Za-z0-9-]*")]
    Ident,
    #[token("=")]
    Equals,
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    /// Anything the grammar does not know.
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    TooManyTokens { processed: usize },
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "too many words on the line ({processed})")
            }
            LexError::Engine => f.write_str("could not tokenise the line"),
        }
    }
}

/// Why a tokenised line was rejected. Columns are 1-based for the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        lexeme: &'a str,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    /// Integer literal that does not fit or is not an accepted value.
    InvalidValue {
        span: Range<usize>,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
}

impl GrammarErrorKind<'_> {
    /// Column of the offending token, if the error points at one.
    #[must_use]
    pub fn column(&self) -> Option<usize> {
        match self {
            GrammarErrorKind::UnexpectedToken { span, .. }
            | GrammarErrorKind::InvalidValue { span }
            | GrammarErrorKind::InvalidToken { span, .. } => Some(span.start + 1),
            GrammarErrorKind::UnexpectedEnd { .. } => None,
        }
    }
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let column = self.column().unwrap_or_default();
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected, lexeme, ..
            } => write!(f, "expected {expected} at column {column}, got `{lexeme}`"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "line ends early, expected {expected}")
            }
            GrammarErrorKind::InvalidValue { .. } => {
                write!(f, "value out of range at column {column}")
            }
            GrammarErrorKind::InvalidToken { lexeme, .. } => {
                write!(f, "stray `{lexeme}` at column {column}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    lexeme: tok.lexeme,
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn invalid_value(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidValue {
                span: token.span.clone(),
            },
        }
    }

    fn invalid_token(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

#[allow(deprecated)]
impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    fn from_error_kind(input: &Input<'src, 'slice>, _kind: ErrorKind) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn append(
        self,
        _input: &Input<'src, 'slice>,
        _token_start: &<Input<'src, 'slice> as Stream>::Checkpoint,
        _kind: ErrorKind,
    ) -> Self {
        self
    }

    fn or(self, other: Self) -> Self {
        other
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// Parsed console command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Status,
    Help { topic: Option<&'a str> },
    Water(WaterCommand),
    Threshold { key: ThresholdKey, value: u32 },
    Afc { enabled: bool },
    Voltage(Voltage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaterCommand {
    /// Run a wet (or dry, when latched) check now.
    Check,
    /// Start the factory water test.
    Wet,
    Sensitivity(WaterSensitivity),
}

/// Tokenizes one line.
///
/// # Errors
///
/// Returns a [`LexError`] for characters outside the console alphabet or
/// a line with too many tokens.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }
        let span = record.start..record.end;
        let lexeme = &line[span.clone()];
        push_token(&mut buffer, record.token, lexeme, span)?;
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let span = partial.start..partial.start + partial.fragment.len();
        push_token(&mut buffer, TokenKind::Error, partial.fragment, span)?;
    }

    Ok(buffer)
}

fn push_token<'a>(
    buffer: &mut TokenBuffer<'a>,
    kind: TokenKind,
    lexeme: &'a str,
    span: Range<usize>,
) -> Result<(), LexError> {
    buffer
        .push(Token { kind, lexeme, span })
        .map_err(|_| LexError::TooManyTokens {
            processed: buffer.len() + 1,
        })
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

/// Parses one console line.
///
/// # Errors
///
/// Returns a [`ParseError`] describing the first token that does not fit
/// the grammar.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    if let Some(token) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(ParseError::Grammar(GrammarError::invalid_token(token)));
    }

    let mut input = tokens.as_slice();
    let command = match command().parse_next(&mut input) {
        Ok(command) => command,
        Err(ErrMode::Backtrack(err) | ErrMode::Cut(err)) => {
            return Err(ParseError::Grammar(err));
        }
        Err(ErrMode::Incomplete(_)) => {
            return Err(ParseError::Grammar(GrammarError::unexpected(
                "token",
                input.first(),
            )));
        }
    };

    match input.iter().find(|token| token.kind != TokenKind::Eol) {
        Some(token) => Err(ParseError::Grammar(GrammarError::unexpected(
            "end of command",
            Some(token),
        ))),
        None => Ok(command),
    }
}

fn command<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let keyword = expect_kind(TokenKind::Ident, "command keyword").parse_next(input)?;
        let Some(spec) = catalog::find(keyword.lexeme) else {
            return Err(ErrMode::Backtrack(GrammarError::unexpected(
                "command keyword",
                Some(&keyword),
            )));
        };

        match spec.tag {
            CommandTag::Status => Ok(Command::Status),
            CommandTag::Help => Ok(Command::Help {
                topic: optional_ident(input).map(|token| token.lexeme),
            }),
            CommandTag::Water => water(input).map(Command::Water),
            CommandTag::Threshold => threshold(input),
            CommandTag::Afc => {
                let enabled = keyword_choice(input, "enable|disable", &[
                    ("enable", true),
                    ("disable", false),
                ])?;
                Ok(Command::Afc { enabled })
            }
            CommandTag::Voltage => {
                let token = expect_kind(TokenKind::Integer, "5|9").parse_next(input)?;
                token
                    .lexeme
                    .parse::<u8>()
                    .ok()
                    .and_then(Voltage::from_volts)
                    .map(Command::Voltage)
                    .ok_or_else(|| ErrMode::Cut(GrammarError::invalid_value(&token)))
            }
        }
    }
}

fn water<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<WaterCommand, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let action = keyword_choice(input, "check|wet|sensitivity", &[
        ("check", 0u8),
        ("wet", 1),
        ("sensitivity", 2),
    ])?;
    match action {
        0 => Ok(WaterCommand::Check),
        1 => Ok(WaterCommand::Wet),
        _ => {
            let level = keyword_choice(input, "low|middle|high", &[
                ("low", WaterSensitivity::Low),
                ("middle", WaterSensitivity::Middle),
                ("high", WaterSensitivity::High),
            ])?;
            Ok(WaterCommand::Sensitivity(level))
        }
    }
}

fn threshold<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<Command<'src>, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let name = expect_kind(TokenKind::Ident, "threshold key").parse_next(input)?;
    let key = ThresholdKey::ALL
        .into_iter()
        .find(|key| key.name().eq_ignore_ascii_case(name.lexeme))
        .ok_or_else(|| ErrMode::Cut(GrammarError::unexpected("threshold key", Some(&name))))?;
    let _ = expect_kind(TokenKind::Equals, "=").parse_next(input)?;
    let literal = expect_kind(TokenKind::Integer, "integer").parse_next(input)?;
    let value = literal
        .lexeme
        .parse::<u32>()
        .map_err(|_| ErrMode::Cut(GrammarError::invalid_value(&literal)))?;
    Ok(Command::Threshold { key, value })
}

/// Consumes one identifier from `choices`, matched case-insensitively.
fn keyword_choice<'src, 'slice, T: Copy>(
    input: &mut Input<'src, 'slice>,
    expected: &'static str,
    choices: &[(&'static str, T)],
) -> Result<T, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let token = expect_kind(TokenKind::Ident, expected).parse_next(input)?;
    choices
        .iter()
        .find(|(keyword, _)| keyword.eq_ignore_ascii_case(token.lexeme))
        .map(|(_, value)| *value)
        .ok_or_else(|| ErrMode::Backtrack(GrammarError::unexpected(expected, Some(&token))))
}

fn optional_ident<'src>(input: &mut Input<'src, '_>) -> Option<Token<'src>> {
    match input.split_first() {
        Some((token, rest)) if token.kind == TokenKind::Ident => {
            *input = rest;
            Some(token.clone())
        }
        _ => None,
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            Some(token),
        ))),
        None => Err(ErrMode::Backtrack(GrammarError::unexpected(label, None))),
    }
}
