//! Filter expression compiler.
//!
//! Compiles the user-facing predicate language (`@id = "x" AND
//! @metadata.topic = "rust"`) into a parameterized SQL fragment. Literals
//! never reach the SQL text: every value becomes a numbered placeholder and
//! a typed parameter, so the output can be appended to a larger query with
//! [`CompiledFilter::offset`].
//!
//! Pipeline: [`token`] → [`parser`] → [`translate`]. Each stage fails with a
//! [`FilterError`] naming the stage, the byte position in the original
//! input, a snippet, and a hint.

mod parser;
mod token;
mod translate;

use thiserror::Error;

pub use parser::{CmpOp, Expr, Field, Literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Tokenizer,
    Parser,
    Translator,
}

impl FilterStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tokenizer => "tokenizer",
            Self::Parser => "parser",
            Self::Translator => "translator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("filter {} error at position {position}: {message} (near `{snippet}`); hint: {hint}", stage.as_str())]
pub struct FilterError {
    pub stage: FilterStage,
    pub position: usize,
    pub snippet: String,
    pub message: String,
    pub hint: String,
}

impl FilterError {
    pub(crate) fn at(
        stage: FilterStage,
        input: &str,
        position: usize,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            position,
            snippet: snippet_at(input, position),
            message: message.into(),
            hint: hint.into(),
        }
    }
}

/// A value bound through the driver rather than spliced into SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterParam {
    Str(String),
    Int(i64),
    Num(f64),
    Bool(bool),
    /// JSON text destined for a `$n::jsonb` cast.
    Jsonb(String),
}

/// A compiled predicate: SQL with `$1`-based placeholders plus the values
/// to bind, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<FilterParam>,
}

impl CompiledFilter {
    /// Renumber placeholders so the fragment can follow `by` existing
    /// parameters in an enclosing query (`$1` becomes `$(by + 1)`).
    pub fn offset(mut self, by: usize) -> Self {
        if by == 0 {
            return self;
        }
        let mut out = String::with_capacity(self.sql.len() + 8);
        let mut chars = self.sql.char_indices().peekable();
        while let Some((_, ch)) = chars.next() {
            if ch != '$' {
                out.push(ch);
                continue;
            }
            let mut digits = String::new();
            while let Some((_, d)) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(*d);
                    chars.next();
                } else {
                    break;
                }
            }
            match digits.parse::<usize>() {
                Ok(n) => {
                    out.push('$');
                    out.push_str(&(n + by).to_string());
                }
                Err(_) => {
                    out.push('$');
                    out.push_str(&digits);
                }
            }
        }
        self.sql = out;
        self
    }
}

/// Compile a filter expression to SQL. Whitespace-only input is rejected.
pub fn compile_filter(input: &str) -> Result<CompiledFilter, FilterError> {
    let tokens = token::tokenize(input)?;
    let expr = parser::parse(input, &tokens)?;
    translate::translate(input, &expr)
}

fn snippet_at(input: &str, position: usize) -> String {
    if input.is_empty() {
        return String::new();
    }
    let position = position.min(input.len());
    let start = input
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= position.saturating_sub(8))
        .last()
        .unwrap_or(0);
    input[start..]
        .chars()
        .take(24)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(params: &[FilterParam]) -> Vec<String> {
        params
            .iter()
            .map(|p| match p {
                FilterParam::Str(s) => s.clone(),
                FilterParam::Int(i) => i.to_string(),
                FilterParam::Num(n) => n.to_string(),
                FilterParam::Bool(b) => b.to_string(),
                FilterParam::Jsonb(j) => j.clone(),
            })
            .collect()
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let compiled =
            compile_filter(r#"@id = "a" OR @id = "b" AND @metadata.kind = "raw""#).unwrap();
        assert_eq!(compiled.sql, "(id = $1 OR (id = $2 AND kind = $3))");
        assert_eq!(strs(&compiled.params), vec!["a", "b", "raw"]);
    }

    #[test]
    fn importance_string_maps_to_integer() {
        let compiled = compile_filter(r#"@metadata.importance = "high""#).unwrap();
        assert_eq!(compiled.sql, "importance = $1");
        assert_eq!(compiled.params, vec![FilterParam::Int(2)]);

        let low = compile_filter(r#"@metadata.importance = "low""#).unwrap();
        assert_eq!(low.params, vec![FilterParam::Int(0)]);
        let medium = compile_filter(r#"@metadata.importance = "medium""#).unwrap();
        assert_eq!(medium.params, vec![FilterParam::Int(1)]);
    }

    #[test]
    fn importance_rejects_unknown_levels() {
        let err = compile_filter(r#"@metadata.importance = "urgent""#).unwrap_err();
        assert_eq!(err.stage, FilterStage::Translator);
    }

    #[test]
    fn custom_field_contains_goes_through_jsonb() {
        let compiled = compile_filter(r#"@metadata.customField CONTAINS "foo""#).unwrap();
        assert_eq!(compiled.sql, "metadata->'customField' @> $1::jsonb");
        assert_eq!(compiled.params, vec![FilterParam::Jsonb("[\"foo\"]".to_string())]);
    }

    #[test]
    fn custom_field_equality_uses_text_extraction() {
        let compiled = compile_filter(r#"@metadata.project = "mnemo""#).unwrap();
        assert_eq!(compiled.sql, "metadata->>'project' = $1");
        assert_eq!(compiled.params, vec![FilterParam::Str("mnemo".to_string())]);
    }

    #[test]
    fn numeric_and_bool_literals_on_custom_fields() {
        let compiled = compile_filter("@metadata.revision = 3").unwrap();
        assert_eq!(compiled.sql, "metadata->>'revision' = $1");
        assert_eq!(compiled.params, vec![FilterParam::Str("3".to_string())]);

        let compiled = compile_filter("@metadata.archived = true").unwrap();
        assert_eq!(compiled.params, vec![FilterParam::Str("true".to_string())]);

        let compiled = compile_filter("@metadata.delta = -0.5").unwrap();
        assert_eq!(compiled.params, vec![FilterParam::Str("-0.5".to_string())]);
    }

    #[test]
    fn tags_only_support_contains() {
        let compiled = compile_filter(r#"@metadata.tags CONTAINS "rust""#).unwrap();
        assert_eq!(compiled.sql, "$1 = ANY(tags)");
        assert_eq!(compiled.params, vec![FilterParam::Str("rust".to_string())]);

        let err = compile_filter(r#"@metadata.tags = "rust""#).unwrap_err();
        assert_eq!(err.stage, FilterStage::Translator);
        assert!(err.hint.contains("CONTAINS"));
    }

    #[test]
    fn id_contains_is_rejected() {
        let err = compile_filter(r#"@id CONTAINS "mem""#).unwrap_err();
        assert_eq!(err.stage, FilterStage::Translator);
    }

    #[test]
    fn bare_metadata_is_rejected() {
        let err = compile_filter(r#"@metadata = "x""#).unwrap_err();
        assert_eq!(err.stage, FilterStage::Translator);
        assert!(err.hint.contains("subfield"));
    }

    #[test]
    fn snake_and_camel_aliases_hit_the_same_columns() {
        let a = compile_filter(r#"@metadata.sourcePath = "a.md""#).unwrap();
        let b = compile_filter(r#"@metadata.source_path = "a.md""#).unwrap();
        assert_eq!(a.sql, "source_path = $1");
        assert_eq!(a.sql, b.sql);

        let a = compile_filter(r#"@metadata.memoryType = "belief""#).unwrap();
        let b = compile_filter(r#"@metadata.memory_type = "belief""#).unwrap();
        assert_eq!(a.sql, "memory_type = $1");
        assert_eq!(a.sql, b.sql);
    }

    #[test]
    fn hostile_keys_cannot_reach_sql_identifiers() {
        for input in [
            r#"@metadata.a'b = "x""#,
            r#"@metadata.- = "x""#,
            r#"@metadata.-x = "x""#,
            r#"@metadata.x- = "x""#,
        ] {
            assert!(compile_filter(input).is_err(), "{input}");
        }
        // Hyphen in the middle is fine.
        assert!(compile_filter(r#"@metadata.my-key = "x""#).is_ok());
        // Single-character keys are fine when alphanumeric.
        assert!(compile_filter(r#"@metadata.x = "1""#).is_ok());
    }

    #[test]
    fn escaped_quotes_in_strings() {
        let compiled = compile_filter(r#"@metadata.quote = "say \"hi\"""#).unwrap();
        assert_eq!(compiled.params, vec![FilterParam::Str("say \"hi\"".to_string())]);
    }

    #[test]
    fn parentheses_override_precedence() {
        let compiled =
            compile_filter(r#"(@id = "a" OR @id = "b") AND @metadata.kind = "raw""#).unwrap();
        assert_eq!(compiled.sql, "((id = $1 OR id = $2) AND kind = $3)");
    }

    #[test]
    fn no_literal_text_ever_lands_in_sql() {
        let compiled = compile_filter(
            r#"@metadata.topic = "Robert'); DROP TABLE memories;--" AND @metadata.tags CONTAINS "x""#,
        )
        .unwrap();
        assert!(!compiled.sql.contains("DROP"));
        assert!(!compiled.sql.contains('\''), "sql was: {}", compiled.sql);
    }

    #[test]
    fn offset_renumbers_placeholders() {
        let compiled = compile_filter(r#"@id = "a" AND @metadata.kind = "raw""#).unwrap();
        let shifted = compiled.offset(4);
        assert_eq!(shifted.sql, "(id = $5 AND kind = $6)");
    }

    #[test]
    fn empty_input_fails_in_the_parser() {
        let err = compile_filter("   ").unwrap_err();
        assert_eq!(err.stage, FilterStage::Parser);
    }

    #[test]
    fn dangling_operator_reports_position() {
        let err = compile_filter(r#"@id = "a" AND"#).unwrap_err();
        assert_eq!(err.stage, FilterStage::Parser);
        assert!(err.position >= 10);
    }

    #[test]
    fn unterminated_string_is_a_tokenizer_error() {
        let err = compile_filter(r#"@id = "abc"#).unwrap_err();
        assert_eq!(err.stage, FilterStage::Tokenizer);
    }

    #[test]
    fn double_equals_is_accepted() {
        let compiled = compile_filter(r#"@id == "a""#).unwrap();
        assert_eq!(compiled.sql, "id = $1");
    }
}
