//! `$regex` operands, parsed once and rendered for each backend: `regex`
//! crate syntax for the in-process matcher, an ARE for Postgres.

use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;

use crate::query::QueryError;

// Postgres rejects larger `{n,m}` bounds.
const MAX_REPEAT: u32 = 255;

const DIGIT: &[(char, char)] = &[('0', '9')];
const WORD: &[(char, char)] = &[('0', '9'), ('A', 'Z'), ('_', '_'), ('a', 'z')];
const SPACE: &[(char, char)] = &[('\t', '\r'), (' ', ' ')];
const ALPHA: &[(char, char)] = &[('A', 'Z'), ('a', 'z')];
const ALNUM: &[(char, char)] = &[('0', '9'), ('A', 'Z'), ('a', 'z')];
const UPPER: &[(char, char)] = &[('A', 'Z')];
const LOWER: &[(char, char)] = &[('a', 'z')];
const XDIGIT: &[(char, char)] = &[('0', '9'), ('A', 'F'), ('a', 'f')];
const BLANK: &[(char, char)] = &[('\t', '\t'), (' ', ' ')];

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    case_insensitive: bool,
    multi_line: bool,
    dot_all: bool,
    extended: bool,
}

impl Flags {
    fn parse(options: &str) -> Result<Self, QueryError> {
        let mut flags = Flags::default();
        for flag in options.chars() {
            match flag {
                'i' => flags.case_insensitive = true,
                'm' => flags.multi_line = true,
                's' => flags.dot_all = true,
                'x' => flags.extended = true,
                other => return Err(QueryError::RegexOption(other)),
            }
        }
        Ok(flags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    /// Grouping, alternation, anchors and quantifiers: spelled the same in
    /// both dialects.
    Syntax(String),
    Literal(char),
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
    AnyChar,
    WordBoundary,
    TextStart,
    TextEnd,
}

enum Escape {
    Char(char),
    Set {
        negated: bool,
        ranges: &'static [(char, char)],
    },
    Assertion(Piece),
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    extended: bool,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_trivia(&mut self) {
        if !self.extended {
            return;
        }
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                return;
            }
        }
    }

    fn parse(mut self) -> Result<Vec<Piece>, String> {
        let mut pieces = Vec::new();
        loop {
            self.skip_trivia();
            let Some(c) = self.bump() else {
                return Ok(pieces);
            };
            let piece = match c {
                '\\' => match self.escape()? {
                    Escape::Char(c) => Piece::Literal(c),
                    Escape::Set { negated, ranges } => Piece::Class {
                        negated,
                        ranges: ranges.to_vec(),
                    },
                    Escape::Assertion(piece) => piece,
                },
                '[' => self.class()?,
                '(' => self.group()?,
                '{' => self.repetition()?,
                '.' => Piece::AnyChar,
                ')' | '|' | '^' | '$' | '*' | '+' | '?' => Piece::Syntax(c.to_string()),
                other => Piece::Literal(other),
            };
            pieces.push(piece);
        }
    }

    fn escape(&mut self) -> Result<Escape, String> {
        let c = self.bump().ok_or("trailing backslash")?;
        Ok(match c {
            'd' | 'D' => Escape::Set {
                negated: c == 'D',
                ranges: DIGIT,
            },
            'w' | 'W' => Escape::Set {
                negated: c == 'W',
                ranges: WORD,
            },
            's' | 'S' => Escape::Set {
                negated: c == 'S',
                ranges: SPACE,
            },
            'b' if self.peek() == Some('{') => return Err("`\\b{...}` boundaries are not supported".into()),
            'b' => Escape::Assertion(Piece::WordBoundary),
            'A' => Escape::Assertion(Piece::TextStart),
            'z' => Escape::Assertion(Piece::TextEnd),
            'n' => Escape::Char('\n'),
            't' => Escape::Char('\t'),
            'r' => Escape::Char('\r'),
            'f' => Escape::Char('\x0C'),
            'v' => Escape::Char('\x0B'),
            'a' => Escape::Char('\x07'),
            'x' => Escape::Char(self.code_point(2)?),
            'u' => Escape::Char(self.code_point(4)?),
            'U' => Escape::Char(self.code_point(8)?),
            '<' | '>' => return Err("word start and end assertions are not supported".into()),
            c if c.is_ascii_alphanumeric() => return Err(format!("escape `\\{c}` is not supported")),
            c => Escape::Char(c),
        })
    }

    fn code_point(&mut self, digits: usize) -> Result<char, String> {
        let text: String = if self.peek() == Some('{') {
            self.pos += 1;
            let mut text = String::new();
            loop {
                match self.bump() {
                    Some('}') => break,
                    Some(c) => text.push(c),
                    None => return Err("unclosed character code".into()),
                }
            }
            text
        } else {
            (0..digits).filter_map(|_| self.bump()).collect()
        };
        u32::from_str_radix(text.trim(), 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| format!("invalid character code `{text}`"))
    }

    fn group(&mut self) -> Result<Piece, String> {
        self.skip_trivia();
        if self.peek() != Some('?') {
            return Ok(Piece::Syntax("(".into()));
        }
        self.pos += 1;
        match (self.peek(), self.peek_at(1)) {
            (Some(':'), _) => {
                self.pos += 1;
                Ok(Piece::Syntax("(?:".into()))
            }
            (Some('<'), _) | (Some('P'), Some('<')) => {
                while self.bump().is_some_and(|c| c != '>') {}
                Ok(Piece::Syntax("(".into()))
            }
            _ => Err("inline flags are not supported; pass them as `$options`".into()),
        }
    }

    fn repetition(&mut self) -> Result<Piece, String> {
        let mut body = String::new();
        loop {
            match self.bump() {
                Some('}') => break,
                Some(c) if c.is_whitespace() => {}
                Some(c) => body.push(c),
                None => return Err("unclosed repetition".into()),
            }
        }
        let bound = |text: &str| -> Result<u32, String> {
            let n: u32 = if text.is_empty() {
                0
            } else {
                text.parse().map_err(|_| format!("bad repetition `{{{body}}}`"))?
            };
            if n > MAX_REPEAT {
                return Err(format!("repetition bound {n} exceeds {MAX_REPEAT}"));
            }
            Ok(n)
        };
        let rendered = match body.split_once(',') {
            None => format!("{{{}}}", bound(&body)?),
            Some((min, "")) => format!("{{{},}}", bound(min)?),
            Some((min, max)) => format!("{{{},{}}}", bound(min)?, bound(max)?),
        };
        Ok(Piece::Syntax(rendered))
    }

    fn class(&mut self) -> Result<Piece, String> {
        self.skip_trivia();
        let negated = self.peek() == Some('^');
        if negated {
            self.pos += 1;
        }
        let mut ranges = Vec::new();
        let mut first = true;
        loop {
            self.skip_trivia();
            let c = self.bump().ok_or("unclosed class")?;
            match c {
                ']' if !first => break,
                '[' if self.peek() == Some(':') => ranges.extend_from_slice(self.posix_class()?),
                '[' => return Err("nested classes are not supported".into()),
                '&' | '-' | '~' if self.peek() == Some(c) => {
                    return Err("class set operations are not supported".into())
                }
                '\\' => match self.escape()? {
                    Escape::Char(lo) => self.range_from(lo, &mut ranges)?,
                    Escape::Set { negated: false, ranges: set } => ranges.extend_from_slice(set),
                    Escape::Set { negated: true, .. } => {
                        return Err("negated escapes inside a class are not supported".into())
                    }
                    Escape::Assertion(_) => return Err("assertions cannot appear inside a class".into()),
                },
                lo => self.range_from(lo, &mut ranges)?,
            }
            first = false;
        }
        Ok(Piece::Class { negated, ranges })
    }

    fn range_from(&mut self, lo: char, ranges: &mut Vec<(char, char)>) -> Result<(), String> {
        self.skip_trivia();
        if self.peek() != Some('-') || matches!(self.peek_at(1), Some(']') | None) {
            ranges.push((lo, lo));
            return Ok(());
        }
        if self.peek_at(1) == Some('-') {
            return Err("class set operations are not supported".into());
        }
        self.pos += 1;
        self.skip_trivia();
        let hi = match self.bump() {
            Some('\\') => match self.escape()? {
                Escape::Char(hi) => hi,
                _ => return Err("a range must end in a single character".into()),
            },
            Some(hi) => hi,
            None => return Err("unclosed class".into()),
        };
        ranges.push((lo, hi));
        Ok(())
    }

    fn posix_class(&mut self) -> Result<&'static [(char, char)], String> {
        self.pos += 1;
        let mut name = String::new();
        loop {
            match self.bump() {
                Some(':') if self.peek() == Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => name.push(c),
                None => return Err("unclosed character class name".into()),
            }
        }
        Ok(match name.as_str() {
            "alpha" => ALPHA,
            "alnum" => ALNUM,
            "digit" => DIGIT,
            "upper" => UPPER,
            "lower" => LOWER,
            "space" => SPACE,
            "word" => WORD,
            "xdigit" => XDIGIT,
            "blank" => BLANK,
            other => return Err(format!("character class `[:{other}:]` is not supported")),
        })
    }
}

fn single(mut mapping: impl Iterator<Item = char>) -> Option<char> {
    let first = mapping.next()?;
    mapping.next().is_none().then_some(first)
}

fn case_variants(c: char) -> Vec<char> {
    let mut variants = vec![c];
    for mapped in [single(c.to_lowercase()), single(c.to_uppercase())].into_iter().flatten() {
        if !variants.contains(&mapped) {
            variants.push(mapped);
        }
    }
    variants
}

fn fold_ranges(ranges: &[(char, char)]) -> Result<Vec<(char, char)>, String> {
    let mut folded = ranges.to_vec();
    for &(lo, hi) in ranges {
        if lo == hi {
            folded.extend(case_variants(lo).into_iter().skip(1).map(|c| (c, c)));
            continue;
        }
        if !hi.is_ascii() {
            return Err(format!("case-insensitive range `{lo}-{hi}` must stay within ASCII"));
        }
        for (start, end) in [('a', 'z'), ('A', 'Z')] {
            let (from, to) = (lo.max(start), hi.min(end));
            if from <= to {
                let flip = |c: char| if start == 'a' { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() };
                folded.push((flip(from), flip(to)));
            }
        }
    }
    Ok(folded)
}

fn fold_case(pieces: Vec<Piece>) -> Result<Vec<Piece>, String> {
    pieces
        .into_iter()
        .map(|piece| match piece {
            Piece::Literal(c) => {
                let variants = case_variants(c);
                Ok(if variants.len() == 1 {
                    Piece::Literal(c)
                } else {
                    Piece::Class {
                        negated: false,
                        ranges: variants.into_iter().map(|v| (v, v)).collect(),
                    }
                })
            }
            Piece::Class { negated, ranges } => Ok(Piece::Class {
                negated,
                ranges: fold_ranges(&ranges)?,
            }),
            other => Ok(other),
        })
        .collect()
}

fn code_escape(c: char) -> String {
    if (c as u32) <= 0xFFFF {
        format!("\\u{:04X}", c as u32)
    } else {
        format!("\\U{:08X}", c as u32)
    }
}

fn rust_char(c: char) -> String {
    if c.is_ascii_graphic() || c == ' ' {
        regex::escape(c.encode_utf8(&mut [0; 4]))
    } else if !c.is_ascii() && !c.is_control() && !c.is_whitespace() {
        c.to_string()
    } else {
        code_escape(c)
    }
}

fn pg_char(c: char) -> String {
    if c.is_ascii_alphanumeric() || c == ' ' {
        c.to_string()
    } else if c.is_ascii_graphic() {
        format!("\\{c}")
    } else if !c.is_ascii() && !c.is_control() && !c.is_whitespace() {
        c.to_string()
    } else {
        code_escape(c)
    }
}

fn render_class(negated: bool, ranges: &[(char, char)], char_fn: fn(char) -> String) -> String {
    let mut out = String::from(if negated { "[^" } else { "[" });
    for &(lo, hi) in ranges {
        out.push_str(&char_fn(lo));
        if hi != lo {
            out.push('-');
            out.push_str(&char_fn(hi));
        }
    }
    out.push(']');
    out
}

fn render_rust(pieces: &[Piece], flags: Flags) -> String {
    pieces
        .iter()
        .map(|piece| match piece {
            Piece::Syntax(text) => text.clone(),
            Piece::Literal(c) => rust_char(*c),
            Piece::Class { negated, ranges } => render_class(*negated, ranges, rust_char),
            Piece::AnyChar if flags.dot_all => "(?s:.)".to_string(),
            Piece::AnyChar => render_class(true, &[('\n', '\n')], rust_char),
            Piece::WordBoundary => r"(?-u:\b)".to_string(),
            Piece::TextStart => r"\A".to_string(),
            Piece::TextEnd => r"\z".to_string(),
        })
        .collect()
}

// `s` and `w` both let brackets match newline, as the `regex` crate does;
// `w` adds line anchors.
fn render_postgres(pieces: &[Piece], flags: Flags) -> String {
    let mut out = String::from(if flags.multi_line { "(?w)" } else { "(?s)" });
    for piece in pieces {
        match piece {
            Piece::Syntax(text) => out.push_str(text),
            Piece::Literal(c) => out.push_str(&pg_char(*c)),
            Piece::Class { negated, ranges } => out.push_str(&render_class(*negated, ranges, pg_char)),
            Piece::AnyChar if flags.dot_all => out.push('.'),
            Piece::AnyChar => out.push_str(&render_class(true, &[('\n', '\n')], pg_char)),
            Piece::WordBoundary => out.push_str(r"\y"),
            Piece::TextStart => out.push_str(r"\A"),
            Piece::TextEnd => out.push_str(r"\Z"),
        }
    }
    out
}

/// Compiled `$regex` operand. Matching is substring-style (unanchored) and
/// case-insensitive unless explicit `$options` say otherwise.
///
/// Only constructs both backends read alike are accepted. `\d`, `\w`, `\s`,
/// `\b` and the POSIX classes are ASCII; `i` folds each literal to its simple
/// upper and lower case forms.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    options: String,
    regex: Regex,
    are: String,
}

impl Pattern {
    pub const DEFAULT_OPTIONS: &'static str = "i";

    pub fn new(source: impl Into<String>, options: Option<&str>) -> Result<Self, QueryError> {
        let source = source.into();
        let options = options.unwrap_or(Self::DEFAULT_OPTIONS).to_string();
        let flags = Flags::parse(&options)?;
        let compile_error = |err: regex::Error| QueryError::Regex {
            pattern: source.clone(),
            source: err,
        };

        RegexBuilder::new(&source)
            .case_insensitive(flags.case_insensitive)
            .multi_line(flags.multi_line)
            .dot_matches_new_line(flags.dot_all)
            .ignore_whitespace(flags.extended)
            .build()
            .map_err(compile_error)?;

        let unportable = |reason: String| QueryError::UnportableRegex {
            pattern: source.clone(),
            reason,
        };
        let mut pieces = Parser {
            chars: source.chars().collect(),
            pos: 0,
            extended: flags.extended,
        }
        .parse()
        .map_err(unportable)?;
        if flags.case_insensitive {
            pieces = fold_case(pieces).map_err(unportable)?;
        }

        let regex = RegexBuilder::new(&render_rust(&pieces, flags))
            .multi_line(flags.multi_line)
            .build()
            .map_err(compile_error)?;
        let are = render_postgres(&pieces, flags);
        Ok(Self {
            source,
            options,
            regex,
            are,
        })
    }

    /// Pattern that matches `needle` literally anywhere in a string.
    pub fn contains(needle: &str) -> Result<Self, QueryError> {
        Self::new(regex::escape(needle), None)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    /// The same pattern as a Postgres ARE, options embedded.
    pub fn postgres_are(&self) -> &str {
        &self.are
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub(crate) fn to_json(&self) -> JsonValue {
        serde_json::json!({ "$regex": self.source, "$options": self.options })
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.options == other.options
    }
}
