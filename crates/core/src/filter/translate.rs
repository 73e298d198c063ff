//! AST → parameterized SQL.
//!
//! A closed set of metadata keys maps onto denormalized columns; everything
//! else routes through the JSONB metadata column. Keys that reach JSONB are
//! shape-checked so no user text can ever act as an SQL identifier.

use regex::Regex;
use std::sync::OnceLock;

use super::parser::{CmpOp, Expr, Field, Literal};
use super::{CompiledFilter, FilterError, FilterParam, FilterStage};

/// Keys with their own columns. Aliases map to the same column.
fn known_column(key: &str) -> Option<&'static str> {
    match key {
        "topic" => Some("topic"),
        "importance" => Some("importance"),
        "tags" => Some("tags"),
        "source" => Some("source"),
        "sourcePath" | "source_path" => Some("source_path"),
        "kind" => Some("kind"),
        "memoryType" | "memory_type" => Some("memory_type"),
        _ => None,
    }
}

fn jsonb_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9_][A-Za-z0-9_-]*[A-Za-z0-9_]|[A-Za-z0-9_])$")
            .expect("key pattern is valid")
    })
}

struct Translator<'a> {
    input: &'a str,
    sql: String,
    params: Vec<FilterParam>,
}

pub(crate) fn translate(input: &str, expr: &Expr) -> Result<CompiledFilter, FilterError> {
    let mut translator = Translator { input, sql: String::new(), params: Vec::new() };
    translator.walk(expr)?;
    Ok(CompiledFilter { sql: translator.sql, params: translator.params })
}

impl<'a> Translator<'a> {
    fn walk(&mut self, expr: &Expr) -> Result<(), FilterError> {
        match expr {
            Expr::Or(left, right) => {
                self.sql.push('(');
                self.walk(left)?;
                self.sql.push_str(" OR ");
                self.walk(right)?;
                self.sql.push(')');
                Ok(())
            }
            Expr::And(left, right) => {
                self.sql.push('(');
                self.walk(left)?;
                self.sql.push_str(" AND ");
                self.walk(right)?;
                self.sql.push(')');
                Ok(())
            }
            Expr::Cmp { field, op, literal, position } => {
                self.comparison(field, *op, literal, *position)
            }
        }
    }

    fn comparison(
        &mut self,
        field: &Field,
        op: CmpOp,
        literal: &Literal,
        position: usize,
    ) -> Result<(), FilterError> {
        match field {
            Field::Id => match op {
                CmpOp::Eq => {
                    let placeholder = self.bind(FilterParam::Str(render_text(literal)));
                    self.sql.push_str(&format!("id = {placeholder}"));
                    Ok(())
                }
                CmpOp::Contains => Err(self.error(
                    position,
                    "CONTAINS is not supported on @id",
                    "use @id = \"<exact id>\"",
                )),
            },
            Field::MetadataRoot => Err(self.error(
                position,
                "@metadata needs a subfield",
                "write @metadata.<key>, e.g. @metadata.topic",
            )),
            Field::MetadataKey(key) => self.metadata_comparison(key, op, literal, position),
        }
    }

    fn metadata_comparison(
        &mut self,
        key: &str,
        op: CmpOp,
        literal: &Literal,
        position: usize,
    ) -> Result<(), FilterError> {
        match known_column(key) {
            Some("importance") => self.importance(op, literal, position),
            Some("tags") => self.tags(op, literal, position),
            Some(column) => match (op, literal) {
                (CmpOp::Eq, Literal::Str(value)) => {
                    let placeholder = self.bind(FilterParam::Str(value.clone()));
                    self.sql.push_str(&format!("{column} = {placeholder}"));
                    Ok(())
                }
                (CmpOp::Eq, _) => Err(self.error(
                    position,
                    format!("`{key}` expects a string value"),
                    "quote the value",
                )),
                (CmpOp::Contains, _) => Err(self.error(
                    position,
                    format!("CONTAINS is not supported on `{key}`"),
                    "CONTAINS works on tags and custom metadata fields",
                )),
            },
            None => self.jsonb(key, op, literal, position),
        }
    }

    fn importance(
        &mut self,
        op: CmpOp,
        literal: &Literal,
        position: usize,
    ) -> Result<(), FilterError> {
        if op == CmpOp::Contains {
            return Err(self.error(
                position,
                "CONTAINS is not supported on `importance`",
                "use importance = \"low\"|\"medium\"|\"high\"",
            ));
        }
        let level = match literal {
            Literal::Str(s) => match s.as_str() {
                "low" => 0,
                "medium" => 1,
                "high" => 2,
                other => {
                    return Err(self.error(
                        position,
                        format!("`{other}` is not an importance level"),
                        "use \"low\", \"medium\", or \"high\"",
                    ))
                }
            },
            Literal::Num(n) if n.fract() == 0.0 => *n as i64,
            _ => {
                return Err(self.error(
                    position,
                    "importance expects a level name or integer",
                    "use \"low\", \"medium\", \"high\", or 0..2",
                ))
            }
        };
        let placeholder = self.bind(FilterParam::Int(level));
        self.sql.push_str(&format!("importance = {placeholder}"));
        Ok(())
    }

    fn tags(&mut self, op: CmpOp, literal: &Literal, position: usize) -> Result<(), FilterError> {
        match (op, literal) {
            (CmpOp::Contains, Literal::Str(value)) => {
                let placeholder = self.bind(FilterParam::Str(value.clone()));
                self.sql.push_str(&format!("{placeholder} = ANY(tags)"));
                Ok(())
            }
            (CmpOp::Contains, _) => Err(self.error(
                position,
                "tags CONTAINS expects a string",
                "quote the tag value",
            )),
            (CmpOp::Eq, _) => Err(self.error(
                position,
                "`tags` is an array column",
                "use @metadata.tags CONTAINS \"<tag>\"",
            )),
        }
    }

    fn jsonb(
        &mut self,
        key: &str,
        op: CmpOp,
        literal: &Literal,
        position: usize,
    ) -> Result<(), FilterError> {
        if !jsonb_key_pattern().is_match(key) {
            return Err(self.error(
                position,
                format!("`{key}` is not a valid metadata key"),
                "keys are alphanumeric/underscore with optional interior hyphens",
            ));
        }
        match op {
            CmpOp::Eq => {
                let placeholder = self.bind(FilterParam::Str(render_text(literal)));
                self.sql.push_str(&format!("metadata->>'{key}' = {placeholder}"));
            }
            CmpOp::Contains => {
                let element = match literal {
                    Literal::Str(s) => serde_json::Value::String(s.clone()),
                    Literal::Num(n) => serde_json::json!(n),
                    Literal::Bool(b) => serde_json::Value::Bool(*b),
                };
                let array_text = serde_json::Value::Array(vec![element]).to_string();
                let placeholder = self.bind(FilterParam::Jsonb(array_text));
                self.sql.push_str(&format!("metadata->'{key}' @> {placeholder}::jsonb"));
            }
        }
        Ok(())
    }

    fn bind(&mut self, param: FilterParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn error(
        &self,
        position: usize,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> FilterError {
        FilterError::at(FilterStage::Translator, self.input, position, message, hint)
    }
}

/// Render a literal the way Postgres' `->>` operator renders JSON scalars,
/// so equality against extracted text behaves as users expect.
fn render_text(literal: &Literal) -> String {
    match literal {
        Literal::Str(s) => s.clone(),
        Literal::Num(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        }
        Literal::Bool(b) => b.to_string(),
    }
}
