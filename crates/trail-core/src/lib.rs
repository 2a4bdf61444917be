//! Audit trail model and data access.
//!
//! A trail records who did what, to which subject, when, and optionally
//! where, why and any extra metadata. This crate owns two layers:
//!
//! - the **trail model** ([`Trail`], [`TrailComponent`] and
//!   [`convert_to_trail`]), which turns loosely-typed JSON into canonical
//!   trails or rejects it with a [`TrailError`];
//! - the **trails manager** ([`TrailsManager`]), which runs parameterised,
//!   paginated, sortable queries against the `trails` table and wraps
//!   writes in transactions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use serde_json::json;
//! use trail_core::{SearchCriteria, TrailsManager};
//!
//! let manager = TrailsManager::connect("trails.db", Default::default())?;
//! let id = manager
//!     .insert(&json!({
//!         "when": "2018-01-01T12:34:56Z",
//!         "who": {"id": "user:1", "name": "Alice"},
//!         "what": "login",
//!         "subject": "console"
//!     }))
//!     .await?;
//!
//! let trails = manager
//!     .search(&SearchCriteria {
//!         who: Some("user".into()),
//!         ..SearchCriteria::between("2018-01-01", "2018-01-02")
//!     })
//!     .await?;
//! ```

mod error;
mod manager;
mod query;
mod trail;

pub use error::{ManagerError, TrailError};
pub use manager::TrailsManager;
pub use query::{
    ComponentKind, EnumerateCriteria, EnumeratePlan, Pagination, ParseComponentKindError,
    SearchCriteria, SearchPlan, Sort, SortKey, SqlQuery, DEFAULT_PAGE_SIZE,
};
pub use trail::{
    convert_to_trail, parse_component, parse_when, validate_additional_fields, Attributes,
    ComponentInput, IdKeys, Trail, TrailComponent, WhenInput, DEFAULT_ID_KEY,
};
