//! Error types for trail validation and storage.

/// Errors raised while converting loosely-typed input into a [`Trail`].
///
/// [`Trail`]: crate::Trail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrailError {
    /// A component was given as a blank string.
    #[error("the \"{0}\" field when passed as a string must be non empty")]
    EmptyField(String),

    /// A component object has no string-valued id property.
    #[error("the \"{key}\" property of the \"{label}\" field must be a string")]
    MissingId {
        /// The component label (`who`, `what` or `subject`).
        label: String,
        /// The property expected to hold the id.
        key: String,
    },

    /// A component object has an id property that is blank.
    #[error("the \"{key}\" property of the \"{label}\" field must be a non empty string")]
    EmptyId {
        /// The component label (`who`, `what` or `subject`).
        label: String,
        /// The property expected to hold the id.
        key: String,
    },

    /// A component is neither a string nor an object.
    #[error("the \"{0}\" field must be either a string or an object")]
    InvalidShape(String),

    /// A date was given as something other than text or a date-time value.
    #[error("only ISO 8601 strings or date-time values are supported for dates")]
    UnsupportedDateType,

    /// A date string could not be parsed.
    #[error("invalid date \"{0}\", please specify a valid UTC date in ISO 8601 format")]
    InvalidDate(String),

    /// `where`, `why` or `meta` is present but not an object.
    #[error("the \"{0}\" field must be either undefined or an object")]
    InvalidAdditionalField(String),

    /// The trail id is neither absent, null nor an integer.
    #[error("the trail id must be a number or null")]
    InvalidTrailId,
}

/// Errors returned by [`TrailsManager`] operations.
///
/// Validation variants are raised before any database work starts; the
/// storage variants are propagated unchanged from the pool or driver.
///
/// [`TrailsManager`]: crate::TrailsManager
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The trail payload failed validation.
    #[error(transparent)]
    Trail(#[from] TrailError),

    /// `from` or `to` was not provided.
    #[error("you must specify the \"{0}\" date when querying trails")]
    MissingRequiredField(&'static str),

    /// A `who`/`what`/`subject` search filter was not a string.
    #[error("only strings are supported for searching in the id of the \"{0}\" field")]
    InvalidFilterType(&'static str),

    /// The sort key is not one of the sortable fields.
    #[error("invalid sort key \"{0}\": only \"id\", \"when\", \"who\", \"what\" and \"subject\" are supported")]
    InvalidSortKey(String),

    /// The enumeration type is missing or outside the whitelist.
    #[error("invalid enumeration type \"{0}\": you must select between \"who\", \"what\" or \"subject\"")]
    InvalidEnumerationType(String),

    /// A SQL statement failed.
    #[error("trail database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A connection could not be acquired from the pool.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The pool could not be created.
    #[error(transparent)]
    PoolInit(#[from] trail_db::PoolError),

    /// The manager was closed and no longer holds a pool.
    #[error("the trails manager has been closed")]
    PoolClosed,

    /// A stored JSON column could not be encoded or decoded.
    #[error("trail serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking database worker panicked or was cancelled.
    #[error("database worker failed: {0}")]
    Task(String),
}

impl ManagerError {
    /// Returns `true` for caller-input errors that the caller can fix by
    /// correcting the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Trail(_)
                | Self::MissingRequiredField(_)
                | Self::InvalidFilterType(_)
                | Self::InvalidSortKey(_)
                | Self::InvalidEnumerationType(_)
        )
    }
}
