//! Query-building helpers shared by the SQL backends.

use super::normalize_extension;
use sqlx::{Database, Encode, QueryBuilder, Type};

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Alphanumeric words of a free-text query, in order.
pub(crate) fn search_terms(query: &str) -> Vec<&str> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .collect()
}

/// Append folder and extension conditions on the documents table aliased `d`.
///
/// Folders match anywhere in the path; extensions are normalized first.
pub(crate) fn push_path_filters<'args, DB>(
    qb: &mut QueryBuilder<'args, DB>,
    folders: &[String],
    extensions: &[String],
) where
    DB: Database,
    String: Encode<'args, DB> + Type<DB>,
{
    let folders: Vec<&String> = folders.iter().filter(|f| !f.trim().is_empty()).collect();
    if !folders.is_empty() {
        qb.push(" AND (");
        for (i, folder) in folders.into_iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("d.file_path LIKE ")
                .push_bind(format!("%{}%", escape_like(folder)))
                .push(" ESCAPE '\\'");
        }
        qb.push(")");
    }

    let extensions: Vec<String> = extensions
        .iter()
        .map(|e| normalize_extension(e))
        .filter(|e| !e.is_empty())
        .collect();
    if !extensions.is_empty() {
        qb.push(" AND d.file_extension IN (");
        let mut separated = qb.separated(", ");
        for extension in extensions {
            separated.push_bind(extension);
        }
        separated.push_unseparated(")");
    }
}
