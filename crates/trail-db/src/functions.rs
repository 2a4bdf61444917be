//! Application-defined SQL functions installed on every pooled connection.

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

/// Name of the Unicode-aware lower-casing function.
///
/// SQLite's built-in `lower()` only folds ASCII letters.
pub const UNICODE_LOWER: &str = "unicode_lower";

/// Registers the crate's scalar functions on `conn`.
///
/// `unicode_lower(text)` lower-cases with full Unicode rules and passes
/// `NULL` through.
///
/// # Errors
///
/// Returns the SQLite error if a function cannot be registered.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        UNICODE_LOWER,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|text| text.to_lowercase()))
        },
    )
}
