//! Parser for the python-literal list columns found in the movies dataset.
//!
//! Columns such as `production_countries`, `genres` and `cast` hold text like
//! `[{'iso_3166_1': 'AR', 'name': 'Argentina'}]`. Only the literal subset those
//! columns use is supported: lists, tuples, dicts, quoted strings, numbers,
//! `None`, `True` and `False`.

use std::iter::Peekable;
use std::str::CharIndices;

use cq_common::{CqError, Result};

/// A parsed python literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Quoted string, escapes resolved.
    Str(String),
    /// Integer or float, kept as written.
    Number(String),
    /// `True` / `False`.
    Bool(bool),
    /// `None`.
    None,
    /// List or tuple.
    List(Vec<Literal>),
    /// Dict in source order.
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    /// Value stored under string key `key`, when `self` is a dict.
    pub fn get(&self, key: &str) -> Option<&Literal> {
        match self {
            Literal::Dict(entries) => entries.iter().find_map(|(k, v)| match k {
                Literal::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    /// The string payload of [`Literal::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Parse one complete literal; trailing non-whitespace is an error.
pub fn parse_literal(text: &str) -> Result<Literal> {
    let mut parser = Parser {
        src: text,
        chars: text.char_indices().peekable(),
    };
    let value = parser.value()?;
    parser.skip_ws();
    match parser.chars.peek() {
        None => Ok(value),
        Some(&(pos, _)) => Err(parser.error(pos, "trailing characters")),
    }
}

/// Extract names from a list column.
///
/// Accepts a list of `{'name': …}` dicts, a list of strings, or plain
/// comma-separated text. Blank text is an empty list; malformed literals are `None`.
pub fn name_list(text: &str) -> Option<Vec<String>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    if !trimmed.starts_with('[') && !trimmed.starts_with('(') {
        return Some(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        );
    }
    let Literal::List(items) = parse_literal(trimmed).ok()? else {
        return None;
    };
    let mut names = Vec::with_capacity(items.len());
    for item in &items {
        match item {
            Literal::Str(s) => names.push(s.trim().to_string()),
            Literal::Dict(_) => {
                if let Some(name) = item.get("name").and_then(Literal::as_str) {
                    names.push(name.trim().to_string());
                }
            }
            _ => return None,
        }
    }
    Some(names)
}

struct Parser<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Parser<'_> {
    fn error(&self, pos: usize, what: &str) -> CqError {
        let end = (pos + 16).min(self.src.len());
        let near = self.src.get(pos..end).unwrap_or("");
        CqError::Decode(format!("literal parse error at {pos} ({what}) near '{near}'"))
    }

    fn eof_error(&self, what: &str) -> CqError {
        CqError::Decode(format!("literal parse error: unexpected end ({what})"))
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn value(&mut self) -> Result<Literal> {
        self.skip_ws();
        let Some(&(pos, c)) = self.chars.peek() else {
            return Err(self.eof_error("expected value"));
        };
        match c {
            '[' => self.sequence(']'),
            '(' => self.sequence(')'),
            '{' => self.dict(),
            '\'' | '"' => self.string().map(Literal::Str),
            '-' | '+' | '.' | '0'..='9' => Ok(self.number()),
            c if c.is_alphabetic() => {
                let word = self.word();
                match word.as_str() {
                    "None" => Ok(Literal::None),
                    "True" => Ok(Literal::Bool(true)),
                    "False" => Ok(Literal::Bool(false)),
                    _ => Err(self.error(pos, "unknown identifier")),
                }
            }
            _ => Err(self.error(pos, "unexpected character")),
        }
    }

    fn sequence(&mut self, close: char) -> Result<Literal> {
        self.chars.next();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.chars.peek() {
                Some(&(_, c)) if c == close => {
                    self.chars.next();
                    return Ok(Literal::List(items));
                }
                None => return Err(self.eof_error("unclosed sequence")),
                _ => {}
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.chars.next() {
                Some((_, ',')) => {}
                Some((_, c)) if c == close => return Ok(Literal::List(items)),
                Some((pos, _)) => return Err(self.error(pos, "expected ',' in sequence")),
                None => return Err(self.eof_error("unclosed sequence")),
            }
        }
    }

    fn dict(&mut self) -> Result<Literal> {
        self.chars.next();
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            match self.chars.peek() {
                Some((_, '}')) => {
                    self.chars.next();
                    return Ok(Literal::Dict(entries));
                }
                None => return Err(self.eof_error("unclosed dict")),
                _ => {}
            }
            let key = self.value()?;
            self.skip_ws();
            match self.chars.next() {
                Some((_, ':')) => {}
                Some((pos, _)) => return Err(self.error(pos, "expected ':' in dict")),
                None => return Err(self.eof_error("unclosed dict")),
            }
            let value = self.value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.chars.next() {
                Some((_, ',')) => {}
                Some((_, '}')) => return Ok(Literal::Dict(entries)),
                Some((pos, _)) => return Err(self.error(pos, "expected ',' in dict")),
                None => return Err(self.eof_error("unclosed dict")),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        let Some((_, quote)) = self.chars.next() else {
            return Err(self.eof_error("expected string"));
        };
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, other)) => out.push(other),
                    None => break,
                },
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
        Err(self.eof_error("unterminated string"))
    }

    fn number(&mut self) -> Literal {
        let mut raw = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_') {
                raw.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        Literal::Number(raw)
    }

    fn word(&mut self) -> String {
        let mut raw = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                raw.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_names_from_dict_lists() {
        let raw = "[{'iso_3166_1': 'AR', 'name': 'Argentina'}, {'iso_3166_1': 'ES', 'name': 'Spain'}]";
        assert_eq!(
            name_list(raw),
            Some(vec!["Argentina".to_string(), "Spain".to_string()])
        );
    }

    #[test]
    fn cast_entries_with_quotes_and_nulls_parse() {
        let raw = r#"[{'cast_id': 1, 'character': "Mario's friend", 'name': 'Ricardo Darín', 'profile_path': None, 'order': 0}]"#;
        assert_eq!(name_list(raw), Some(vec!["Ricardo Darín".to_string()]));
    }

    #[test]
    fn accepts_string_lists_and_plain_text() {
        assert_eq!(
            name_list("['Drama', \"Comedy\"]"),
            Some(vec!["Drama".to_string(), "Comedy".to_string()])
        );
        assert_eq!(
            name_list("Argentina, Spain"),
            Some(vec!["Argentina".to_string(), "Spain".to_string()])
        );
        assert_eq!(name_list("  "), Some(Vec::new()));
        assert_eq!(name_list("[]"), Some(Vec::new()));
    }

    #[test]
    fn malformed_literals_are_rejected() {
        assert_eq!(name_list("[{'name': 'Unclosed'"), None);
        assert_eq!(name_list("[1, 2]"), None);
        assert!(parse_literal("[1] trailing").is_err());
        assert!(parse_literal("{'a' 1}").is_err());
    }

    #[test]
    fn parses_nested_values() {
        let lit = parse_literal("{'a': [1, -2.5, True], 'b': (None,)}").expect("parse");
        assert_eq!(
            lit.get("a"),
            Some(&Literal::List(vec![
                Literal::Number("1".to_string()),
                Literal::Number("-2.5".to_string()),
                Literal::Bool(true),
            ]))
        );
        assert_eq!(lit.get("b"), Some(&Literal::List(vec![Literal::None])));
    }
}
