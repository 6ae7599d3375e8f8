//! Expression parsing and identifier qualification over the sqlparser AST.

use std::ops::ControlFlow;

use postgres_protocol::escape::escape_literal;
use sqlparser::ast::{Expr, Function, FunctionArguments, Ident, SelectItem, visit_expressions_mut};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use super::dimension::Dimension;
use crate::error::{JobError, Result};

pub const TARGET_ALIAS: &str = "target";
pub const SOURCE_ALIAS: &str = "source";

const GEOMETRY_TARGET: &str = "geometry_target";
const GEOMETRY_SOURCE: &str = "geometry_source";

/// Server-side functions that read relations, files, settings or other
/// databases. Matched against the unqualified, lowercased function name.
const BLOCKED_FUNCTION_PREFIXES: [&str; 12] = [
    "query_to_xml",
    "table_to_xml",
    "cursor_to_xml",
    "schema_to_xml",
    "database_to_xml",
    "dblink",
    "lo_",
    "pg_read_",
    "pg_ls_",
    "pg_stat_file",
    "pg_terminate_backend",
    "pg_cancel_backend",
];
const BLOCKED_FUNCTIONS: [&str; 4] = ["set_config", "current_setting", "pg_sleep", "txid_current"];

/// Which table aliases an expression may reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// The `ON` predicate: both sides, qualified explicitly.
    Join,
    Target,
    Source,
}

/// A column reference found while qualifying an expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    /// The name as written by the caller.
    pub name: String,
    /// The qualified SQL that replaced it.
    pub rendered: String,
}

pub struct Resolver {
    target: Dimension,
    source: Dimension,
    geometry_target: Expr,
    geometry_source: Expr,
}

impl Resolver {
    pub fn new(target: Dimension, source: Dimension) -> Result<Self> {
        Ok(Self {
            target,
            source,
            geometry_target: parse_expr(&target.geometry_expr(TARGET_ALIAS), "Invalid join condition")?,
            geometry_source: parse_expr(&source.geometry_expr(SOURCE_ALIAS), "Invalid join condition")?,
        })
    }

    /// Parses `text` as one expression and qualifies it for `scope`.
    pub fn expression(&self, text: &str, scope: Scope, error: &'static str) -> Result<(Expr, Vec<ColumnRef>)> {
        let mut expr = parse_expr(text, error)?;
        let columns = self.qualify(&mut expr, scope, error)?;
        Ok((expr, columns))
    }

    /// Parses one aggregate select item, `<func>(<expr>) [AS alias]`.
    /// `FILTER` and `OVER` clauses are rejected; the compiler adds its own
    /// filter.
    pub fn aggregate(&self, text: &str) -> Result<(Expr, Option<Ident>, Vec<ColumnRef>)> {
        const ERROR: &str = "Invalid aggregate syntax";
        let (mut expr, alias) = select_item(text, ERROR)?;
        match &expr {
            Expr::Function(Function { filter: None, over: None, .. }) => {}
            _ => return Err(JobError::invalid(ERROR)),
        }
        let columns = self.qualify(&mut expr, Scope::Source, ERROR)?;
        Ok((expr, alias, columns))
    }

    /// Parses one source attribute, `<column> [AS alias]`, and returns the
    /// qualified column with its lowercased output key.
    pub fn attribute(&self, text: &str) -> Result<(Expr, String)> {
        const ERROR: &str = "Invalid attribute syntax";
        let (mut expr, alias) = select_item(text, ERROR)?;
        if !matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_)) {
            return Err(JobError::invalid(ERROR));
        }
        let columns = self.qualify(&mut expr, Scope::Source, ERROR)?;
        let [column] = columns.as_slice() else {
            return Err(JobError::invalid(ERROR));
        };
        let key = match alias {
            Some(alias) => alias.value,
            None => column.name.trim_start_matches("ext:").to_string(),
        };
        Ok((expr, key.to_lowercase()))
    }

    /// Replaces one side's geometry with `text`, an expression over that
    /// side in which the side's own placeholder stands for its current
    /// geometry. Later placeholder substitutions use the transformed form.
    pub fn transform(&mut self, scope: Scope, text: &str) -> Result<()> {
        const ERROR: &str = "Invalid geometry transform";
        let (expr, _) = self.expression(text, scope, ERROR)?;
        match scope {
            Scope::Target => self.geometry_target = expr,
            Scope::Source => self.geometry_source = expr,
            Scope::Join => return Err(JobError::invalid(ERROR)),
        }
        Ok(())
    }

    fn qualify(&self, expr: &mut Expr, scope: Scope, error: &'static str) -> Result<Vec<ColumnRef>> {
        let mut columns = Vec::new();
        let flow = visit_expressions_mut(expr, |node| {
            let replacement = match node {
                Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. } => {
                    return ControlFlow::Break(JobError::invalid(error));
                }
                Expr::Function(function) => {
                    if matches!(function.args, FunctionArguments::Subquery(_)) || is_blocked(function) {
                        return ControlFlow::Break(JobError::invalid(error));
                    }
                    return ControlFlow::Continue(());
                }
                Expr::Identifier(ident) => match self.placeholder(ident, scope) {
                    Some(Ok(geometry)) => geometry.clone(),
                    Some(Err(())) => return ControlFlow::Break(JobError::invalid(error)),
                    None => {
                        let side = match scope {
                            Scope::Target => TARGET_ALIAS,
                            Scope::Source => SOURCE_ALIAS,
                            Scope::Join => return ControlFlow::Continue(()),
                        };
                        match self.column(side, ident) {
                            Ok((expr, column)) => {
                                columns.push(column);
                                expr
                            }
                            Err(err) => return ControlFlow::Break(err),
                        }
                    }
                },
                Expr::CompoundIdentifier(parts) => {
                    let [qualifier, ident] = parts.as_slice() else {
                        return ControlFlow::Break(JobError::invalid(error));
                    };
                    let side = qualifier.value.to_ascii_lowercase();
                    let allowed = match scope {
                        Scope::Join => side == TARGET_ALIAS || side == SOURCE_ALIAS,
                        Scope::Target => side == TARGET_ALIAS,
                        Scope::Source => side == SOURCE_ALIAS,
                    };
                    if !allowed {
                        return ControlFlow::Break(JobError::invalid(error));
                    }
                    let side = if side == TARGET_ALIAS { TARGET_ALIAS } else { SOURCE_ALIAS };
                    match self.column(side, ident) {
                        Ok((expr, column)) => {
                            columns.push(column);
                            expr
                        }
                        Err(err) => return ControlFlow::Break(err),
                    }
                }
                _ => return ControlFlow::Continue(()),
            };
            *node = replacement;
            ControlFlow::Continue(())
        });
        match flow {
            ControlFlow::Break(err) => Err(err),
            ControlFlow::Continue(()) => Ok(columns),
        }
    }

    /// The geometry a placeholder stands for. A side filter may only name
    /// its own side's placeholder.
    fn placeholder(&self, ident: &Ident, scope: Scope) -> Option<std::result::Result<&Expr, ()>> {
        if ident.value.eq_ignore_ascii_case(GEOMETRY_TARGET) {
            Some(if scope == Scope::Source { Err(()) } else { Ok(&self.geometry_target) })
        } else if ident.value.eq_ignore_ascii_case(GEOMETRY_SOURCE) {
            Some(if scope == Scope::Target { Err(()) } else { Ok(&self.geometry_source) })
        } else {
            None
        }
    }

    fn column(&self, side: &'static str, ident: &Ident) -> Result<(Expr, ColumnRef)> {
        let dimension = if side == TARGET_ALIAS { self.target } else { self.source };
        let name = ident.value.clone();
        let expr = if name.starts_with("ext:") || dimension.is_extension() {
            property_lookup(side, &name)?
        } else {
            let column = dimension.resolve_field(&name);
            let column = match ident.quote_style {
                Some(quote) => Ident::with_quote(quote, column),
                None => Ident::new(column),
            };
            Expr::CompoundIdentifier(vec![Ident::new(side), column])
        };
        let rendered = expr.to_string();
        Ok((expr, ColumnRef { name, rendered }))
    }
}

fn is_blocked(function: &Function) -> bool {
    let name = function.name.to_string();
    let name = name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .trim_matches('"')
        .to_ascii_lowercase();
    BLOCKED_FUNCTIONS.contains(&name.as_str())
        || BLOCKED_FUNCTION_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Parses a single `<expr> [AS alias]` select item, rejecting trailing tokens.
fn select_item(text: &str, error: &'static str) -> Result<(Expr, Option<Ident>)> {
    let prepared = quote_extension_refs(text);
    let mut parser = Parser::new(&PostgreSqlDialect {})
        .try_with_sql(&prepared)
        .map_err(|_| JobError::invalid(error))?;
    let item = parser.parse_select_item().map_err(|_| JobError::invalid(error))?;
    if parser.peek_token().token != Token::EOF {
        return Err(JobError::invalid(error));
    }
    match item {
        SelectItem::UnnamedExpr(expr) => Ok((expr, None)),
        SelectItem::ExprWithAlias { expr, alias } => Ok((expr, Some(alias))),
        _ => Err(JobError::invalid(error)),
    }
}

/// `(<alias>.feature -> 'properties' ->> '<name>')`
fn property_lookup(alias: &str, name: &str) -> Result<Expr> {
    parse_expr(
        &format!("({alias}.feature -> 'properties' ->> {})", escape_literal(name)),
        "Invalid join filter",
    )
}

/// Parses a complete expression, rejecting trailing tokens.
pub fn parse_expr(text: &str, error: &'static str) -> Result<Expr> {
    let prepared = quote_extension_refs(text);
    let mut parser = Parser::new(&PostgreSqlDialect {})
        .try_with_sql(&prepared)
        .map_err(|_| JobError::invalid(error))?;
    let expr = parser.parse_expr().map_err(|_| JobError::invalid(error))?;
    if parser.peek_token().token != Token::EOF {
        return Err(JobError::invalid(error));
    }
    Ok(expr)
}

/// Wraps bare `ext:<name>` references in double quotes so they lex as a
/// single identifier. String literals and quoted identifiers are left alone.
pub fn quote_extension_refs(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if let Some(open) = quote {
            out.push(c);
            if c == open {
                quote = None;
            }
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
            out.push(c);
            i += 1;
            continue;
        }
        let at_boundary = i == 0 || !is_ident_char(chars[i - 1]);
        let is_ext = chars[i..].starts_with(&['e', 'x', 't', ':'])
            && chars.get(i + 4).is_some_and(|next| is_ident_char(*next));
        if at_boundary && is_ext {
            let end = chars[i + 4..]
                .iter()
                .position(|ch| !is_ident_char(*ch))
                .map_or(chars.len(), |offset| i + 4 + offset);
            out.push('"');
            out.extend(&chars[i..end]);
            out.push('"');
            i = end;
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
