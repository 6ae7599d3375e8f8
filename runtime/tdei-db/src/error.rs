use std::fmt;

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Distinguishable database failure classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    UndefinedColumn,
    UndefinedFunction,
    AmbiguousColumn,
    SyntaxError,
    Generic,
}

impl DbErrorKind {
    /// Maps a five-character SQLSTATE code to its kind.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "23505" => Self::UniqueViolation,
            "23503" => Self::ForeignKeyViolation,
            "42703" => Self::UndefinedColumn,
            "42883" => Self::UndefinedFunction,
            "42702" => Self::AmbiguousColumn,
            "42601" => Self::SyntaxError,
            _ => Self::Generic,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::UniqueViolation => "unique violation",
            Self::ForeignKeyViolation => "foreign key violation",
            Self::UndefinedColumn => "undefined column",
            Self::UndefinedFunction => "undefined function",
            Self::AmbiguousColumn => "ambiguous column",
            Self::SyntaxError => "syntax error",
            Self::Generic => "database error",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Generic, message)
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        let kind = err
            .code()
            .map(|state: &SqlState| DbErrorKind::from_sqlstate(state.code()))
            .unwrap_or(DbErrorKind::Generic);
        let message = match err.as_db_error() {
            Some(db) => match db.constraint() {
                Some(constraint) if kind == DbErrorKind::ForeignKeyViolation => {
                    format!("{} ({constraint})", db.message())
                }
                _ => db.message().to_string(),
            },
            None => err.to_string(),
        };
        Self { kind, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_table_covers_reported_kinds() {
        let cases = [
            ("23505", DbErrorKind::UniqueViolation),
            ("23503", DbErrorKind::ForeignKeyViolation),
            ("42703", DbErrorKind::UndefinedColumn),
            ("42883", DbErrorKind::UndefinedFunction),
            ("42702", DbErrorKind::AmbiguousColumn),
            ("42601", DbErrorKind::SyntaxError),
            ("57014", DbErrorKind::Generic),
            ("", DbErrorKind::Generic),
        ];
        for (code, kind) in cases {
            assert_eq!(DbErrorKind::from_sqlstate(code), kind, "code {code}");
        }
    }

    #[test]
    fn display_includes_kind_label() {
        let err = DbError::new(DbErrorKind::UndefinedColumn, "column \"foo\" does not exist");
        assert_eq!(
            err.to_string(),
            "undefined column: column \"foo\" does not exist"
        );
    }
}
