//! The canonical trail entity and the conversion functions that produce it.
//!
//! Every trail that reaches storage, and every trail read back from it,
//! passes through [`convert_to_trail`]. The functions here are pure: they
//! never mutate their input and never touch the database.

use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, Timelike, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::TrailError;

/// Free-form string-keyed attributes.
pub type Attributes = Map<String, Value>;

/// The property holding a component id when no override is given.
pub const DEFAULT_ID_KEY: &str = "id";

/// Extended-format time layouts; basic-format times are read by hand.
const EXTENDED_TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// One of the three named actors of a trail: `who`, `what` or `subject`.
///
/// The id is never blank and the attributes never contain the id property.
/// Serializes flat, as `{"id": ..., ...attributes}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailComponent {
    id: String,
    #[serde(flatten)]
    attributes: Attributes,
}

impl TrailComponent {
    /// The trimmed, non-empty component id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Everything else the caller attached to the component.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trail {
    id: Option<i64>,
    #[serde(serialize_with = "serialize_when")]
    when: DateTime<Utc>,
    who: TrailComponent,
    what: TrailComponent,
    subject: TrailComponent,
    r#where: Attributes,
    why: Attributes,
    meta: Attributes,
}

impl Trail {
    /// The store-assigned id; `None` until the trail has been persisted.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// When the event happened, in UTC.
    pub fn when(&self) -> DateTime<Utc> {
        self.when
    }

    pub fn who(&self) -> &TrailComponent {
        &self.who
    }

    pub fn what(&self) -> &TrailComponent {
        &self.what
    }

    pub fn subject(&self) -> &TrailComponent {
        &self.subject
    }

    pub fn r#where(&self) -> &Attributes {
        &self.r#where
    }

    pub fn why(&self) -> &Attributes {
        &self.why
    }

    pub fn meta(&self) -> &Attributes {
        &self.meta
    }
}

fn serialize_when<S: Serializer>(when: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&when.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// The two accepted shapes of a component before validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentInput<'a> {
    /// A bare identifier.
    Id(&'a str),
    /// A structured object carrying the id alongside other attributes.
    Object(&'a Attributes),
}

impl<'a> ComponentInput<'a> {
    /// Dispatches a loosely-typed value onto one of the accepted shapes.
    ///
    /// # Errors
    ///
    /// Returns `TrailError::InvalidShape` for numbers, arrays, booleans and
    /// null.
    pub fn classify(value: &'a Value, label: &str) -> Result<Self, TrailError> {
        match value {
            Value::String(id) => Ok(Self::Id(id)),
            Value::Object(object) => Ok(Self::Object(object)),
            _ => Err(TrailError::InvalidShape(label.to_string())),
        }
    }
}

/// Converts a `who`/`what`/`subject` value into a [`TrailComponent`].
///
/// Strings become `{id, attributes: {}}`. Objects must carry a non-blank
/// string under `id_key`; the remaining properties are copied into the
/// attributes.
///
/// # Errors
///
/// `EmptyField` for a blank string, `MissingId`/`EmptyId` for objects
/// without a usable id, `InvalidShape` for any other type.
pub fn parse_component(value: &Value, label: &str, id_key: &str) -> Result<TrailComponent, TrailError> {
    match ComponentInput::classify(value, label)? {
        ComponentInput::Id(id) => {
            let id = id.trim();
            if id.is_empty() {
                return Err(TrailError::EmptyField(label.to_string()));
            }

            Ok(TrailComponent {
                id: id.to_string(),
                attributes: Attributes::new(),
            })
        }
        ComponentInput::Object(object) => {
            let id = match object.get(id_key) {
                Some(Value::String(id)) => id.trim(),
                _ => {
                    return Err(TrailError::MissingId {
                        label: label.to_string(),
                        key: id_key.to_string(),
                    })
                }
            };
            if id.is_empty() {
                return Err(TrailError::EmptyId {
                    label: label.to_string(),
                    key: id_key.to_string(),
                });
            }

            let attributes = object
                .iter()
                .filter(|(key, _)| key.as_str() != id_key)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            Ok(TrailComponent {
                id: id.to_string(),
                attributes,
            })
        }
    }
}

/// A timestamp-like input accepted by [`parse_when`].
#[derive(Debug, Clone, PartialEq)]
pub enum WhenInput {
    /// ISO 8601 text.
    Text(String),
    /// An already UTC-aware timestamp.
    Utc(DateTime<Utc>),
    /// A timestamp in some fixed offset.
    Offset(DateTime<FixedOffset>),
    /// A native system time.
    System(SystemTime),
}

impl From<&str> for WhenInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for WhenInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<DateTime<Utc>> for WhenInput {
    fn from(when: DateTime<Utc>) -> Self {
        Self::Utc(when)
    }
}

impl From<DateTime<FixedOffset>> for WhenInput {
    fn from(when: DateTime<FixedOffset>) -> Self {
        Self::Offset(when)
    }
}

impl From<SystemTime> for WhenInput {
    fn from(when: SystemTime) -> Self {
        Self::System(when)
    }
}

impl TryFrom<&Value> for WhenInput {
    type Error = TrailError;

    /// Only JSON strings can carry a date; every other JSON type is rejected.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(text) => Ok(Self::Text(text.clone())),
            _ => Err(TrailError::UnsupportedDateType),
        }
    }
}

/// Normalizes a timestamp-like input to UTC.
///
/// Text is read as RFC 3339 first, then as ISO 8601 in extended or basic
/// format: a calendar date, optionally followed by a time of hour, minute
/// or second precision and a `Z`/`±HH[:MM]` offset. Text without an offset
/// is taken as UTC.
///
/// # Errors
///
/// Returns `TrailError::InvalidDate` when text matches none of the
/// accepted layouts or names an impossible date.
pub fn parse_when(input: impl Into<WhenInput>) -> Result<DateTime<Utc>, TrailError> {
    match input.into() {
        WhenInput::Utc(when) => Ok(when),
        WhenInput::Offset(when) => Ok(when.with_timezone(&Utc)),
        WhenInput::System(when) => Ok(DateTime::<Utc>::from(when)),
        WhenInput::Text(text) => parse_iso(&text).ok_or(TrailError::InvalidDate(text)),
    }
}

fn parse_iso(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(when) = DateTime::parse_from_rfc3339(text) {
        return Some(when.with_timezone(&Utc));
    }

    let (date, time) = match text.find(|c: char| matches!(c, 'T' | 't' | ' ')) {
        Some(idx) => (&text[..idx], Some(&text[idx + 1..])),
        None => (text, None),
    };
    let date = parse_iso_date(date)?;

    let Some(time) = time else {
        return date.and_hms_opt(0, 0, 0).map(|when| when.and_utc());
    };

    let (time, offset) = split_offset(time)?;
    let local = date.and_time(parse_iso_time(time)?);

    match offset {
        None => Some(local.and_utc()),
        Some(offset) => local
            .and_local_timezone(offset)
            .single()
            .map(|when| when.with_timezone(&Utc)),
    }
}

/// `YYYY-MM-DD` or basic `YYYYMMDD`.
fn parse_iso_date(text: &str) -> Option<NaiveDate> {
    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::from_ymd_opt(
            text[..4].parse().ok()?,
            text[4..6].parse().ok()?,
            text[6..].parse().ok()?,
        );
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

/// Splits a trailing `Z`, `±HH`, `±HHMM` or `±HH:MM` off a time.
///
/// Returns `None` for a malformed offset; a time without one yields
/// `(time, None)`.
fn split_offset(time: &str) -> Option<(&str, Option<FixedOffset>)> {
    if let Some(rest) = time.strip_suffix('Z').or_else(|| time.strip_suffix('z')) {
        return Some((rest, Some(FixedOffset::east_opt(0)?)));
    }

    let Some(idx) = time.rfind(|c: char| c == '+' || c == '-') else {
        return Some((time, None));
    };

    let raw = &time[idx + 1..];
    let (hours, minutes) = match raw.len() {
        2 => (raw, "00"),
        4 => (raw.get(..2)?, raw.get(2..)?),
        5 if raw.as_bytes()[2] == b':' => (raw.get(..2)?, raw.get(3..)?),
        _ => return None,
    };
    let hours = two_digits(hours).filter(|h| *h <= 23)?;
    let minutes = two_digits(minutes).filter(|m| *m <= 59)?;

    let seconds = (hours * 3600 + minutes * 60) as i32;
    let seconds = if time[idx..].starts_with('-') { -seconds } else { seconds };
    Some((&time[..idx], Some(FixedOffset::east_opt(seconds)?)))
}

/// Extended `HH:MM[:SS[.fff]]` or basic `HH[MM[SS[.fff]]]`.
fn parse_iso_time(time: &str) -> Option<NaiveTime> {
    let time = time.replacen(',', ".", 1);

    if time.contains(':') {
        return EXTENDED_TIME_FORMATS
            .iter()
            .find_map(|format| NaiveTime::parse_from_str(&time, format).ok());
    }

    let (whole, fraction) = match time.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (time.as_str(), None),
    };
    if !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let (hours, minutes, seconds) = match whole.len() {
        2 => (two_digits(whole)?, 0, 0),
        4 => (two_digits(&whole[..2])?, two_digits(&whole[2..])?, 0),
        6 => (
            two_digits(&whole[..2])?,
            two_digits(&whole[2..4])?,
            two_digits(&whole[4..])?,
        ),
        _ => return None,
    };
    let base = NaiveTime::from_hms_opt(hours, minutes, seconds)?;

    match fraction {
        None => Some(base),
        // Fractions only make sense on full seconds.
        Some(fraction)
            if whole.len() == 6
                && (1..=9).contains(&fraction.len())
                && fraction.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base.with_nanosecond(format!("{fraction:0<9}").parse().ok()?)
        }
        Some(_) => None,
    }
}

fn two_digits(text: &str) -> Option<u32> {
    if text.len() == 2 && text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse().ok()
    } else {
        None
    }
}

/// Validates `where`, `why` and `meta`.
///
/// Absent (or null) values become an empty map.
///
/// # Errors
///
/// Returns `TrailError::InvalidAdditionalField` for arrays and scalars.
pub fn validate_additional_fields(value: Option<&Value>, label: &str) -> Result<Attributes, TrailError> {
    match value {
        None | Some(Value::Null) => Ok(Attributes::new()),
        Some(Value::Object(object)) => Ok(object.clone()),
        Some(_) => Err(TrailError::InvalidAdditionalField(label.to_string())),
    }
}

/// Per-component overrides of the property that holds the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdKeys {
    pub who: String,
    pub what: String,
    pub subject: String,
}

impl Default for IdKeys {
    fn default() -> Self {
        Self {
            who: DEFAULT_ID_KEY.to_string(),
            what: DEFAULT_ID_KEY.to_string(),
            subject: DEFAULT_ID_KEY.to_string(),
        }
    }
}

/// Converts a loosely-typed record into a canonical [`Trail`].
///
/// This is the only way to build a `Trail`.
///
/// # Errors
///
/// Returns the first [`TrailError`] hit, checking fields in the order
/// `id`, `when`, `who`, `what`, `subject`, `where`, `why`, `meta`.
pub fn convert_to_trail(raw: &Value, id_keys: &IdKeys) -> Result<Trail, TrailError> {
    let record = raw
        .as_object()
        .ok_or_else(|| TrailError::InvalidShape("trail".to_string()))?;
    let field = |name: &str| record.get(name).unwrap_or(&Value::Null);

    let id = match field("id") {
        Value::Null => None,
        Value::Number(number) => Some(number.as_i64().ok_or(TrailError::InvalidTrailId)?),
        _ => return Err(TrailError::InvalidTrailId),
    };

    Ok(Trail {
        id,
        when: parse_when(WhenInput::try_from(field("when"))?)?,
        who: parse_component(field("who"), "who", &id_keys.who)?,
        what: parse_component(field("what"), "what", &id_keys.what)?,
        subject: parse_component(field("subject"), "subject", &id_keys.subject)?,
        r#where: validate_additional_fields(record.get("where"), "where")?,
        why: validate_additional_fields(record.get("why"), "why")?,
        meta: validate_additional_fields(record.get("meta"), "meta")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "when": "2018-04-11T07:00:00.123-09:00",
            "who": "who",
            "what": {"id": "what", "additional": true},
            "subject": "subject"
        })
    }

    #[test]
    fn component_from_string() {
        let component = parse_component(&json!("  abc "), "who", "id").expect("should parse");
        assert_eq!(component.id(), "abc");
        assert!(component.attributes().is_empty());
    }

    #[test]
    fn component_from_blank_string_fails() {
        let err = parse_component(&json!("   "), "who", "id").expect_err("blank should fail");
        assert_eq!(err, TrailError::EmptyField("who".to_string()));
    }

    #[test]
    fn component_from_object_strips_id() {
        let input = json!({"id": " abc ", "name": "Alice", "tags": [1, 2]});
        let component = parse_component(&input, "who", "id").expect("should parse");

        assert_eq!(component.id(), "abc");
        assert_eq!(
            Value::Object(component.attributes().clone()),
            json!({"name": "Alice", "tags": [1, 2]})
        );
        // The caller's object is left alone.
        assert_eq!(input["id"], " abc ");
    }

    #[test]
    fn component_with_custom_id_key() {
        let input = json!({"uid": "u-1", "id": "ignored-as-attribute"});
        let component = parse_component(&input, "who", "uid").expect("should parse");

        assert_eq!(component.id(), "u-1");
        assert_eq!(
            Value::Object(component.attributes().clone()),
            json!({"id": "ignored-as-attribute"})
        );
    }

    #[test]
    fn component_object_id_errors() {
        assert_eq!(
            parse_component(&json!({"name": "x"}), "what", "id"),
            Err(TrailError::MissingId {
                label: "what".to_string(),
                key: "id".to_string()
            })
        );
        assert_eq!(
            parse_component(&json!({"id": 12}), "what", "id"),
            Err(TrailError::MissingId {
                label: "what".to_string(),
                key: "id".to_string()
            })
        );
        assert_eq!(
            parse_component(&json!({"id": "  "}), "what", "id"),
            Err(TrailError::EmptyId {
                label: "what".to_string(),
                key: "id".to_string()
            })
        );
    }

    #[test]
    fn component_rejects_other_shapes() {
        for value in [json!(1), json!([1, 2]), json!(null), json!(true)] {
            assert_eq!(
                parse_component(&value, "subject", "id"),
                Err(TrailError::InvalidShape("subject".to_string())),
                "value {value} should be rejected"
            );
        }
    }

    #[test]
    fn when_normalizes_offsets_to_utc() {
        let when = parse_when("2018-04-11T07:00:00.123-09:00").expect("should parse");
        let expected = Utc
            .with_ymd_and_hms(2018, 4, 11, 16, 0, 0)
            .single()
            .expect("valid date")
            + chrono::Duration::milliseconds(123);
        assert_eq!(when, expected);
    }

    #[test]
    fn when_accepts_typed_values() {
        let utc = Utc
            .with_ymd_and_hms(2018, 1, 1, 12, 0, 0)
            .single()
            .expect("valid date");
        assert_eq!(parse_when(utc), Ok(utc));

        let offset = utc.with_timezone(&FixedOffset::east_opt(3_600).expect("valid offset"));
        assert_eq!(parse_when(offset), Ok(utc));

        let system: SystemTime = utc.into();
        assert_eq!(parse_when(system), Ok(utc));
    }

    #[test]
    fn when_accepts_offsetless_and_date_only_text() {
        let midnight = Utc
            .with_ymd_and_hms(2018, 1, 2, 0, 0, 0)
            .single()
            .expect("valid date");
        assert_eq!(parse_when("2018-01-02"), Ok(midnight));
        assert_eq!(parse_when("2018-01-02T00:00:00"), Ok(midnight));
        assert_eq!(parse_when("2018-01-02T01:00:00+0100"), Ok(midnight));
    }

    #[test]
    fn when_accepts_reduced_precision_and_basic_format() {
        let noon = Utc
            .with_ymd_and_hms(2018, 1, 1, 12, 0, 0)
            .single()
            .expect("valid date");

        for text in [
            "2018-01-01T12:00Z",
            "2018-01-01T13:00+01:00",
            "2018-01-01T13:00+0100",
            "2018-01-01T13+01",
            "2018-01-01T12",
            "2018-01-01T12Z",
            "20180101T120000Z",
            "20180101T1200",
            "20180101T130000+01:00",
        ] {
            assert_eq!(parse_when(text), Ok(noon), "{text}");
        }

        assert_eq!(
            parse_when("20180101"),
            Ok(noon - chrono::Duration::hours(12))
        );
        assert_eq!(
            parse_when("20180101T120000,5Z"),
            Ok(noon + chrono::Duration::milliseconds(500))
        );
        assert_eq!(
            parse_when("2018-01-01T07:00:00.250-05:00"),
            Ok(noon + chrono::Duration::milliseconds(250))
        );
    }

    #[test]
    fn when_rejects_malformed_iso_parts() {
        for text in [
            "2018-01-01T",
            "2018-01-01T1",
            "2018-01-01T123",
            "2018-01-01T25:00",
            "2018-01-01T12:00+1",
            "2018-01-01T12:00+24:00",
            "2018-01-01T1200.5",
            "2018011T120000Z",
            "2018-01-01Té",
        ] {
            assert_eq!(
                parse_when(text),
                Err(TrailError::InvalidDate(text.to_string())),
                "{text}"
            );
        }
    }

    #[test]
    fn when_rejects_garbage() {
        assert_eq!(
            parse_when("whatever"),
            Err(TrailError::InvalidDate("whatever".to_string()))
        );
        assert_eq!(
            parse_when("2018-02-30T00:00:00Z"),
            Err(TrailError::InvalidDate("2018-02-30T00:00:00Z".to_string()))
        );
        assert_eq!(
            WhenInput::try_from(&json!(1234)),
            Err(TrailError::UnsupportedDateType)
        );
    }

    #[test]
    fn additional_fields() {
        assert_eq!(validate_additional_fields(None, "meta"), Ok(Attributes::new()));
        assert_eq!(
            validate_additional_fields(Some(&json!({"a": 1})), "meta").map(Value::Object),
            Ok(json!({"a": 1}))
        );
        assert_eq!(
            validate_additional_fields(Some(&json!([1])), "why"),
            Err(TrailError::InvalidAdditionalField("why".to_string()))
        );
        assert_eq!(
            validate_additional_fields(Some(&json!("x")), "where"),
            Err(TrailError::InvalidAdditionalField("where".to_string()))
        );
    }

    #[test]
    fn convert_builds_canonical_trail() {
        let trail = convert_to_trail(&sample(), &IdKeys::default()).expect("should convert");

        assert_eq!(trail.id(), None);
        assert_eq!(
            trail.when().to_rfc3339_opts(SecondsFormat::Millis, true),
            "2018-04-11T16:00:00.123Z"
        );
        assert_eq!(trail.who().id(), "who");
        assert_eq!(trail.what().id(), "what");
        assert_eq!(trail.what().attributes().get("additional"), Some(&json!(true)));
        assert_eq!(trail.subject().id(), "subject");
        assert!(trail.r#where().is_empty());
        assert!(trail.why().is_empty());
        assert!(trail.meta().is_empty());
    }

    #[test]
    fn convert_validates_id() {
        let mut raw = sample();
        raw["id"] = json!(42);
        assert_eq!(
            convert_to_trail(&raw, &IdKeys::default()).map(|t| t.id()),
            Ok(Some(42))
        );

        raw["id"] = json!("42");
        assert_eq!(
            convert_to_trail(&raw, &IdKeys::default()),
            Err(TrailError::InvalidTrailId)
        );

        raw["id"] = json!(1.5);
        assert_eq!(
            convert_to_trail(&raw, &IdKeys::default()),
            Err(TrailError::InvalidTrailId)
        );
    }

    #[test]
    fn convert_reports_first_bad_field() {
        let mut raw = sample();
        raw["who"] = json!(3);
        raw["meta"] = json!("bad");
        assert_eq!(
            convert_to_trail(&raw, &IdKeys::default()),
            Err(TrailError::InvalidShape("who".to_string()))
        );

        let raw = json!({"who": "a", "what": "b", "subject": "c"});
        assert_eq!(
            convert_to_trail(&raw, &IdKeys::default()),
            Err(TrailError::UnsupportedDateType)
        );

        assert_eq!(
            convert_to_trail(&json!([]), &IdKeys::default()),
            Err(TrailError::InvalidShape("trail".to_string()))
        );
    }

    #[test]
    fn serializes_components_flat() {
        let trail = convert_to_trail(&sample(), &IdKeys::default()).expect("should convert");
        let json = serde_json::to_value(&trail).expect("should serialize");

        assert_eq!(
            json,
            json!({
                "id": null,
                "when": "2018-04-11T16:00:00.123Z",
                "who": {"id": "who"},
                "what": {"id": "what", "additional": true},
                "subject": {"id": "subject"},
                "where": {},
                "why": {},
                "meta": {}
            })
        );
    }
}
