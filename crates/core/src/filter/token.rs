//! Tokenizer for the filter DSL.

use super::{FilterError, FilterStage};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// `@id`, `@metadata`, or `@metadata.<key>`.
    Field { root: String, key: Option<String> },
    Eq,
    Contains,
    And,
    Or,
    LParen,
    RParen,
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset into the original input.
    pub position: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, position: i });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, position: i });
                i += 1;
            }
            '=' => {
                let start = i;
                i += 1;
                if i < bytes.len() && bytes[i] == b'=' {
                    i += 1;
                }
                tokens.push(Token { kind: TokenKind::Eq, position: start });
            }
            '"' => {
                let (value, next) = read_string(input, i)?;
                tokens.push(Token { kind: TokenKind::Str(value), position: i });
                i = next;
            }
            '@' => {
                let (root, key, next) = read_field(input, i)?;
                tokens.push(Token { kind: TokenKind::Field { root, key }, position: i });
                i = next;
            }
            '-' | '0'..='9' => {
                let (value, next) = read_number(input, i)?;
                tokens.push(Token { kind: TokenKind::Num(value), position: i });
                i = next;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                    i += 1;
                }
                let word = &input[start..i];
                let kind = match word.to_ascii_uppercase().as_str() {
                    "AND" => TokenKind::And,
                    "OR" => TokenKind::Or,
                    "CONTAINS" => TokenKind::Contains,
                    "TRUE" => TokenKind::Bool(true),
                    "FALSE" => TokenKind::Bool(false),
                    _ => {
                        return Err(FilterError::at(
                            FilterStage::Tokenizer,
                            input,
                            start,
                            format!("unexpected word `{word}`"),
                            "expected AND, OR, CONTAINS, true, false, or a quoted string",
                        ))
                    }
                };
                tokens.push(Token { kind, position: start });
            }
            other => {
                return Err(FilterError::at(
                    FilterStage::Tokenizer,
                    input,
                    i,
                    format!("unexpected character `{other}`"),
                    "fields start with @, strings are double-quoted",
                ))
            }
        }
    }

    Ok(tokens)
}

/// Read a double-quoted string with `\"` and `\\` escapes. Returns the
/// unescaped value and the index just past the closing quote.
fn read_string(input: &str, start: usize) -> Result<(String, usize), FilterError> {
    let bytes = input.as_bytes();
    let mut value = String::new();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 >= bytes.len() {
                    break;
                }
                match bytes[i + 1] {
                    b'"' => value.push('"'),
                    b'\\' => value.push('\\'),
                    other => {
                        value.push('\\');
                        value.push(other as char);
                    }
                }
                i += 2;
            }
            b'"' => return Ok((value, i + 1)),
            _ => {
                // Multi-byte chars are copied verbatim.
                let ch_start = i;
                let ch = input[ch_start..].chars().next().unwrap_or('\u{fffd}');
                value.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    Err(FilterError::at(
        FilterStage::Tokenizer,
        input,
        start,
        "unterminated string literal",
        "close the string with a double quote",
    ))
}

fn read_number(input: &str, start: usize) -> Result<(f64, usize), FilterError> {
    let bytes = input.as_bytes();
    let mut i = start;
    if bytes[i] == b'-' {
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text = &input[start..i];
    if i == digits_start || text == "-" {
        return Err(FilterError::at(
            FilterStage::Tokenizer,
            input,
            start,
            format!("`{text}` is not a number"),
            "numbers look like 42, -3, or 0.5",
        ));
    }
    text.parse::<f64>().map(|n| (n, i)).map_err(|_| {
        FilterError::at(
            FilterStage::Tokenizer,
            input,
            start,
            format!("`{text}` is not a number"),
            "numbers look like 42, -3, or 0.5",
        )
    })
}

/// Read `@id`, `@metadata`, or `@metadata.<key>`. The key may contain
/// letters, digits, underscores, and hyphens; shape is validated by the
/// translator.
fn read_field(input: &str, start: usize) -> Result<(String, Option<String>, usize), FilterError> {
    let bytes = input.as_bytes();
    let mut i = start + 1;
    let root_start = i;
    while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    let root = input[root_start..i].to_string();
    if root.is_empty() {
        return Err(FilterError::at(
            FilterStage::Tokenizer,
            input,
            start,
            "`@` must be followed by a field name",
            "use @id or @metadata.<key>",
        ));
    }

    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let key_start = i;
        while i < bytes.len()
            && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'-')
        {
            i += 1;
        }
        let key = input[key_start..i].to_string();
        if key.is_empty() {
            return Err(FilterError::at(
                FilterStage::Tokenizer,
                input,
                start,
                "metadata key is missing after `.`",
                "use @metadata.<key>",
            ));
        }
        return Ok((root, Some(key), i));
    }

    Ok((root, None, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_full_expression() {
        let tokens = tokenize(r#"(@id = "a") AND @metadata.n = -1.5"#).unwrap();
        let kinds: Vec<_> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LParen,
                TokenKind::Field { root: "id".to_string(), key: None },
                TokenKind::Eq,
                TokenKind::Str("a".to_string()),
                TokenKind::RParen,
                TokenKind::And,
                TokenKind::Field { root: "metadata".to_string(), key: Some("n".to_string()) },
                TokenKind::Eq,
                TokenKind::Num(-1.5),
            ]
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let tokens = tokenize("true and false or contains").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::And);
        assert_eq!(tokens[3].kind, TokenKind::Or);
        assert_eq!(tokens[4].kind, TokenKind::Contains);
    }

    #[test]
    fn positions_point_into_the_input() {
        let tokens = tokenize(r#"@id = "abc""#).unwrap();
        assert_eq!(tokens[0].position, 0);
        assert_eq!(tokens[1].position, 4);
        assert_eq!(tokens[2].position, 6);
    }

    #[test]
    fn bare_at_fails() {
        assert!(tokenize("@ = 1").is_err());
        assert!(tokenize("@metadata. = 1").is_err());
    }

    #[test]
    fn lone_minus_fails() {
        assert!(tokenize("- ").is_err());
    }
}
