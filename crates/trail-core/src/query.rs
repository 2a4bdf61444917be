//! Search and enumeration criteria, their sanitization, and the SQL they
//! compile to.
//!
//! Criteria are checked in full before any SQL text is produced. Caller
//! values only ever reach the database as bound parameters; the only
//! identifiers spliced into SQL text come from the closed [`ComponentKind`]
//! and [`SortKey`] enums.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trail_db::UNICODE_LOWER;

use crate::error::ManagerError;
use crate::trail::{parse_when, WhenInput};

/// Page size used when none (or an invalid one) is given.
pub const DEFAULT_PAGE_SIZE: i64 = 25;

/// Columns selected whenever full trails are read back.
pub(crate) const TRAIL_COLUMNS: &str = r#"id, "when", who_id, what_id, subject_id, who_data, what_data, subject_data, "where", why, meta"#;

/// Formats a timestamp the way it is stored in the `when` column.
///
/// Fixed-width nanosecond precision keeps text order equal to time order.
pub(crate) fn storage_timestamp(when: &DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// The three components a trail can be searched or enumerated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Who,
    What,
    Subject,
}

impl ComponentKind {
    /// Returns the canonical lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Who => "who",
            Self::What => "what",
            Self::Subject => "subject",
        }
    }

    /// Returns the column holding this component's id.
    pub fn id_column(self) -> &'static str {
        match self {
            Self::Who => "who_id",
            Self::What => "what_id",
            Self::Subject => "subject_id",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComponentKind {
    type Err = ParseComponentKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "who" => Ok(Self::Who),
            "what" => Ok(Self::What),
            "subject" => Ok(Self::Subject),
            _ => Err(ParseComponentKindError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown component kind.
#[derive(Debug, Clone)]
pub struct ParseComponentKindError(pub String);

impl std::fmt::Display for ParseComponentKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown component kind: {}", self.0)
    }
}

impl std::error::Error for ParseComponentKindError {}

impl From<ParseComponentKindError> for ManagerError {
    fn from(err: ParseComponentKindError) -> Self {
        Self::InvalidEnumerationType(err.0)
    }
}

/// Fields a search can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Id,
    When,
    Who,
    What,
    Subject,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::When => r#""when""#,
            Self::Who => "who_id",
            Self::What => "what_id",
            Self::Subject => "subject_id",
        }
    }
}

/// A sanitized sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub ascending: bool,
}

impl Default for Sort {
    /// Newest first.
    fn default() -> Self {
        Self {
            key: SortKey::When,
            ascending: false,
        }
    }
}

impl Sort {
    /// Parses `key` or `-key` (descending).
    ///
    /// A missing or empty value yields the default, `-when`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidSortKey` for anything outside
    /// `id`, `when`, `who`, `what`, `subject`.
    pub fn parse(raw: Option<&str>) -> Result<Self, ManagerError> {
        let raw = match raw {
            None | Some("") => return Ok(Self::default()),
            Some(raw) => raw,
        };

        let (name, ascending) = match raw.strip_prefix('-') {
            Some(name) => (name, false),
            None => (raw, true),
        };

        let key = match name {
            "id" => SortKey::Id,
            "when" => SortKey::When,
            "who" => SortKey::Who,
            "what" => SortKey::What,
            "subject" => SortKey::Subject,
            _ => return Err(ManagerError::InvalidSortKey(raw.to_string())),
        };

        Ok(Self { key, ascending })
    }

    fn order_by(self) -> String {
        let direction = if self.ascending { "ASC" } else { "DESC" };
        match self.key {
            SortKey::Id => format!("id {direction}"),
            key => format!("{} {direction}, id ASC", key.column()),
        }
    }
}

/// Sanitized pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number.
    pub page: i64,
    pub page_size: i64,
}

impl Pagination {
    /// Falls back to page 1 and [`DEFAULT_PAGE_SIZE`] for missing or
    /// non-positive values.
    pub fn sanitize(page: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            page: page.filter(|p| *p >= 1).unwrap_or(1),
            page_size: page_size.filter(|s| *s >= 1).unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// A SQL statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlQuery {
    /// A statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Appends a bound parameter.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Criteria for [`TrailsManager::search`](crate::TrailsManager::search).
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    /// Inclusive lower bound. Required.
    pub from: Option<WhenInput>,
    /// Inclusive upper bound. Required.
    pub to: Option<WhenInput>,
    pub who: Option<String>,
    pub what: Option<String>,
    pub subject: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    /// `key` or `-key`; defaults to `-when`.
    pub sort: Option<String>,
    /// Match whole ids instead of substrings.
    pub exact_match: bool,
    pub case_insensitive: bool,
}

impl SearchCriteria {
    /// Criteria covering `[from, to]` with everything else defaulted.
    pub fn between(from: impl Into<WhenInput>, to: impl Into<WhenInput>) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            ..Self::default()
        }
    }

    /// Checks and sanitizes the criteria.
    ///
    /// # Errors
    ///
    /// `MissingRequiredField` if `from` or `to` is absent, `Trail` for an
    /// unparsable date, `InvalidSortKey` for a bad sort.
    pub fn validate(&self) -> Result<SearchPlan, ManagerError> {
        let (from, to) = validate_range(self.from.as_ref(), self.to.as_ref())?;

        let filters = [
            (ComponentKind::Who, &self.who),
            (ComponentKind::What, &self.what),
            (ComponentKind::Subject, &self.subject),
        ]
        .into_iter()
        .filter_map(|(kind, value)| match value.as_deref() {
            None | Some("") => None,
            Some(value) => Some((kind, value.to_string())),
        })
        .collect();

        Ok(SearchPlan {
            from,
            to,
            filters,
            exact_match: self.exact_match,
            case_insensitive: self.case_insensitive,
            pagination: Pagination::sanitize(self.page, self.page_size),
            sort: Sort::parse(self.sort.as_deref())?,
        })
    }
}

impl TryFrom<&Value> for SearchCriteria {
    type Error = ManagerError;

    /// Reads loosely-typed criteria such as a decoded query string.
    ///
    /// Keys follow the wire names: `from`, `to`, `who`, `what`, `subject`,
    /// `page`, `pageSize`, `sort`, `exactMatch`, `caseInsensitive`.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let empty = Map::new();
        let object = value.as_object().unwrap_or(&empty);

        Ok(Self {
            from: loose_when(object.get("from"))?,
            to: loose_when(object.get("to"))?,
            who: loose_filter(object.get("who"), ComponentKind::Who)?,
            what: loose_filter(object.get("what"), ComponentKind::What)?,
            subject: loose_filter(object.get("subject"), ComponentKind::Subject)?,
            page: object.get("page").and_then(loose_integer),
            page_size: object.get("pageSize").and_then(loose_integer),
            sort: match object.get("sort") {
                None | Some(Value::Null) => None,
                Some(Value::String(sort)) => Some(sort.clone()),
                Some(other) => return Err(ManagerError::InvalidSortKey(other.to_string())),
            },
            exact_match: object.get("exactMatch").is_some_and(loose_bool),
            case_insensitive: object.get("caseInsensitive").is_some_and(loose_bool),
        })
    }
}

/// A validated search, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPlan {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub filters: Vec<(ComponentKind, String)>,
    pub exact_match: bool,
    pub case_insensitive: bool,
    pub pagination: Pagination,
    pub sort: Sort,
}

impl SearchPlan {
    /// Compiles the plan into a parameterised `SELECT`.
    pub fn to_sql(&self) -> SqlQuery {
        let mut clauses = vec![r#""when" >= ?1"#.to_string(), r#""when" <= ?2"#.to_string()];
        let mut params = vec![
            SqlValue::Text(storage_timestamp(&self.from)),
            SqlValue::Text(storage_timestamp(&self.to)),
        ];

        for (kind, needle) in &self.filters {
            let idx = params.len() + 1;
            let column = kind.id_column();
            clauses.push(match (self.exact_match, self.case_insensitive) {
                (true, false) => format!("{column} = ?{idx}"),
                (true, true) => format!("{UNICODE_LOWER}({column}) = {UNICODE_LOWER}(?{idx})"),
                (false, false) => format!("instr({column}, ?{idx}) > 0"),
                (false, true) => format!("instr({UNICODE_LOWER}({column}), {UNICODE_LOWER}(?{idx})) > 0"),
            });
            params.push(SqlValue::Text(needle.clone()));
        }

        let limit_idx = params.len() + 1;
        let offset_idx = limit_idx + 1;
        params.push(SqlValue::Integer(self.pagination.limit()));
        params.push(SqlValue::Integer(self.pagination.offset()));

        SqlQuery {
            sql: format!(
                "SELECT {TRAIL_COLUMNS} FROM trails WHERE {} ORDER BY {} LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
                clauses.join(" AND "),
                self.sort.order_by(),
            ),
            params,
        }
    }
}

/// Criteria for [`TrailsManager::enumerate`](crate::TrailsManager::enumerate).
#[derive(Debug, Clone, Default)]
pub struct EnumerateCriteria {
    pub from: Option<WhenInput>,
    pub to: Option<WhenInput>,
    /// Which component's ids to list. Required.
    pub kind: Option<ComponentKind>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    /// Sort ids in descending alphabetical order.
    pub desc: bool,
}

impl EnumerateCriteria {
    /// Criteria listing `kind` ids within `[from, to]`.
    pub fn between(from: impl Into<WhenInput>, to: impl Into<WhenInput>, kind: ComponentKind) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Checks and sanitizes the criteria.
    ///
    /// # Errors
    ///
    /// `MissingRequiredField` if `from` or `to` is absent, `Trail` for an
    /// unparsable date, `InvalidEnumerationType` if no kind was chosen.
    pub fn validate(&self) -> Result<EnumeratePlan, ManagerError> {
        let (from, to) = validate_range(self.from.as_ref(), self.to.as_ref())?;
        let kind = self
            .kind
            .ok_or_else(|| ManagerError::InvalidEnumerationType(String::new()))?;

        Ok(EnumeratePlan {
            from,
            to,
            kind,
            pagination: Pagination::sanitize(self.page, self.page_size),
            desc: self.desc,
        })
    }
}

impl TryFrom<&Value> for EnumerateCriteria {
    type Error = ManagerError;

    /// Keys: `from`, `to`, `type`, `page`, `pageSize`, `desc`.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let empty = Map::new();
        let object = value.as_object().unwrap_or(&empty);

        let kind = match object.get("type") {
            None | Some(Value::Null) => None,
            Some(Value::String(kind)) => Some(kind.parse::<ComponentKind>()?),
            Some(other) => return Err(ManagerError::InvalidEnumerationType(other.to_string())),
        };

        Ok(Self {
            from: loose_when(object.get("from"))?,
            to: loose_when(object.get("to"))?,
            kind,
            page: object.get("page").and_then(loose_integer),
            page_size: object.get("pageSize").and_then(loose_integer),
            desc: object.get("desc").is_some_and(loose_bool),
        })
    }
}

/// A validated enumeration, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratePlan {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub kind: ComponentKind,
    pub pagination: Pagination,
    pub desc: bool,
}

impl EnumeratePlan {
    /// Compiles the plan into a parameterised `SELECT DISTINCT`.
    ///
    /// The projected column comes from [`ComponentKind::id_column`], never
    /// from caller text.
    pub fn to_sql(&self) -> SqlQuery {
        let column = self.kind.id_column();
        let direction = if self.desc { "DESC" } else { "ASC" };

        SqlQuery {
            sql: format!(
                r#"SELECT DISTINCT {column} AS entry FROM trails WHERE "when" >= ?1 AND "when" <= ?2 ORDER BY entry {direction} LIMIT ?3 OFFSET ?4"#
            ),
            params: vec![
                SqlValue::Text(storage_timestamp(&self.from)),
                SqlValue::Text(storage_timestamp(&self.to)),
                SqlValue::Integer(self.pagination.limit()),
                SqlValue::Integer(self.pagination.offset()),
            ],
        }
    }
}

fn validate_range(
    from: Option<&WhenInput>,
    to: Option<&WhenInput>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ManagerError> {
    let from = from.ok_or(ManagerError::MissingRequiredField("from"))?;
    let to = to.ok_or(ManagerError::MissingRequiredField("to"))?;

    Ok((parse_when(from.clone())?, parse_when(to.clone())?))
}

/// Absent, null and empty values all count as missing.
fn loose_when(value: Option<&Value>) -> Result<Option<WhenInput>, ManagerError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.is_empty() => Ok(None),
        Some(value) => Ok(Some(WhenInput::try_from(value)?)),
    }
}

fn loose_filter(value: Option<&Value>, kind: ComponentKind) -> Result<Option<String>, ManagerError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ManagerError::InvalidFilterType(kind.as_str())),
    }
}

/// Numbers are truncated; strings are read up to the first non-digit.
fn loose_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
        }),
        Value::String(text) => leading_integer(text),
        _ => None,
    }
}

fn leading_integer(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (negative, rest) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let digits_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 {
        return None;
    }

    let magnitude: i64 = rest[..digits_len].parse().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

fn loose_bool(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => matches!(text.as_str(), "true" | "1"),
        Value::Number(number) => number.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}
