//! Static catalogue of every GTFS table and field known to the store.
//!
//! The registry is built once at first use and never mutated afterwards. The
//! loader, the validators and the exporter all read the same definitions, so
//! the three can never disagree on a field's type, requiredness or
//! normalization.

use chrono::NaiveDate;
use lazy_static::lazy_static;

use crate::storage::Value;

/// Semantic type of a field, a closed set.
///
/// Each variant carries its own ingest transform (external text to internal
/// [Value]) and the matching inverse (internal [Value] back to external
/// text). The two are exact inverses for every value that ingests cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Free text, stored as-is
    Text,
    /// Entity identifier, stored as text
    Id,
    /// Whole number
    Integer,
    /// Floating point number
    Double,
    /// Calendar date, `YYYYMMDD` externally, integer `yyyymmdd` internally
    Date,
    /// Time of day, `HH:MM:SS` externally (hours may exceed 24 for
    /// post-midnight service), seconds since the start of the service day
    /// internally
    Time,
}

impl FieldType {
    /// Converts the external textual form to the internal value.
    ///
    /// An empty string is always the absent value, never an error; whether
    /// absence is acceptable is the caller's concern (requiredness lives on
    /// [FieldDef], not here).
    pub fn ingest(self, raw: &str) -> Result<Value, String> {
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            FieldType::Text | FieldType::Id => Ok(Value::Text(raw.to_owned())),
            FieldType::Integer => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("'{raw}' is not a valid integer")),
            FieldType::Double => raw
                .parse::<f64>()
                .map(Value::Real)
                .map_err(|_| format!("'{raw}' is not a valid number")),
            FieldType::Date => parse_date(raw).map(Value::Int),
            FieldType::Time => parse_time(raw).map(Value::Int),
        }
    }

    /// Converts the internal value back to its external textual form.
    ///
    /// [Value::Null] always becomes the empty string, never a literal
    /// `null` token.
    pub fn emit(self, value: &Value) -> String {
        match (self, value) {
            (_, Value::Null) => String::new(),
            (FieldType::Date, Value::Int(d)) => format!("{d:08}"),
            (FieldType::Time, Value::Int(s)) => format_time(*s),
            (_, Value::Text(s)) => s.clone(),
            (_, Value::Int(i)) => i.to_string(),
            (_, Value::Real(f)) => f.to_string(),
        }
    }
}

/// Parses a `YYYYMMDD` date, validating it as a real calendar day.
pub fn parse_date(raw: &str) -> Result<i64, String> {
    let date = NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map_err(|_| format!("'{raw}' is not a valid YYYYMMDD date"))?;
    date.format("%Y%m%d")
        .to_string()
        .parse::<i64>()
        .map_err(|_| format!("'{raw}' is not a valid YYYYMMDD date"))
}

/// Parses a `HH:MM:SS` time into elapsed seconds.
///
/// Hours may legitimately exceed 24: `25:10:00` is ten past one in the
/// morning on the day after the service day started.
pub fn parse_time(raw: &str) -> Result<i64, String> {
    let len = raw.len();
    if !raw.is_ascii() || !(7..=8).contains(&len) {
        return Err(format!("'{raw}' is not a valid HH:MM:SS time"));
    }
    let err = || format!("'{raw}' is not a valid HH:MM:SS time");
    if &raw[len - 3..len - 2] != ":" || &raw[len - 6..len - 5] != ":" {
        return Err(err());
    }
    let hours: i64 = raw[..len - 6].parse().map_err(|_| err())?;
    let minutes: i64 = raw[len - 5..len - 3].parse().map_err(|_| err())?;
    let seconds: i64 = raw[len - 2..].parse().map_err(|_| err())?;
    if minutes > 59 || seconds > 59 {
        return Err(err());
    }
    Ok(hours * 3600 + minutes * 60 + seconds)
}

/// Formats elapsed seconds back to `HH:MM:SS`.
pub fn format_time(seconds: i64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        seconds % 3600 / 60,
        seconds % 60
    )
}

/// One field of a table: name, semantic type, requiredness and an optional
/// foreign-key target `(table, field)`.
#[derive(Debug)]
pub struct FieldDef {
    /// Column name, identical in the archive header and in storage
    pub name: &'static str,
    /// Semantic type carrying the ingest/inverse transforms
    pub field_type: FieldType,
    /// Whether a row without this field is flagged
    pub required: bool,
    /// Table and field this field must resolve into, if any
    pub references: Option<(&'static str, &'static str)>,
}

/// A per-parent sequence field rewritten to a zero-based index on load.
#[derive(Debug)]
pub struct SequenceDef {
    /// Field whose value groups rows into one sequence (e.g. `trip_id`)
    pub partition: &'static str,
    /// The ordinal field itself (e.g. `stop_sequence`)
    pub field: &'static str,
}

/// One table of the registry.
#[derive(Debug)]
pub struct TableDef {
    /// Table name; the archive file is `<name>.txt`
    pub name: &'static str,
    /// A feed without this table gets a table-level fatal result
    pub required: bool,
    /// Created empty by the snapshot manager, never loaded or exported
    pub editor_only: bool,
    /// In from-editor exports this table is derived by the editor, so an
    /// empty one is omitted instead of written header-only
    pub editor_optional: bool,
    /// Fields forming the row identity, empty when the table has none
    pub key_fields: &'static [&'static str],
    /// Ordered field list, also the storage column order
    pub fields: Vec<FieldDef>,
    /// Sequence normalization applied after load, if any
    pub sequence: Option<SequenceDef>,
}

impl TableDef {
    /// Looks a field up by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn new(name: &'static str, fields: Vec<FieldDef>) -> Self {
        TableDef {
            name,
            required: false,
            editor_only: false,
            editor_optional: false,
            key_fields: &[],
            fields,
            sequence: None,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn keyed(mut self, key_fields: &'static [&'static str]) -> Self {
        self.key_fields = key_fields;
        self
    }

    fn editor_only(mut self) -> Self {
        self.editor_only = true;
        self
    }

    fn editor_optional(mut self) -> Self {
        self.editor_optional = true;
        self
    }

    fn sequenced(mut self, partition: &'static str, field: &'static str) -> Self {
        self.sequence = Some(SequenceDef { partition, field });
        self
    }
}

fn field(name: &'static str, field_type: FieldType) -> FieldDef {
    FieldDef {
        name,
        field_type,
        required: false,
        references: None,
    }
}

fn req(name: &'static str, field_type: FieldType) -> FieldDef {
    FieldDef {
        required: true,
        ..field(name, field_type)
    }
}

fn fk(mut def: FieldDef, table: &'static str, target: &'static str) -> FieldDef {
    def.references = Some((table, target));
    def
}

lazy_static! {
    /// Every table the store knows about, in dependency order: a table
    /// always appears after every table it foreign-keys into.
    pub static ref TABLES: Vec<TableDef> = vec![
        TableDef::new(
            "agency",
            vec![
                field("agency_id", FieldType::Id),
                req("agency_name", FieldType::Text),
                req("agency_url", FieldType::Text),
                req("agency_timezone", FieldType::Text),
                field("agency_lang", FieldType::Text),
                field("agency_phone", FieldType::Text),
                field("agency_fare_url", FieldType::Text),
                field("agency_email", FieldType::Text),
            ],
        )
        .required()
        .keyed(&["agency_id"]),
        TableDef::new(
            "calendar",
            vec![
                req("service_id", FieldType::Id),
                req("monday", FieldType::Integer),
                req("tuesday", FieldType::Integer),
                req("wednesday", FieldType::Integer),
                req("thursday", FieldType::Integer),
                req("friday", FieldType::Integer),
                req("saturday", FieldType::Integer),
                req("sunday", FieldType::Integer),
                req("start_date", FieldType::Date),
                req("end_date", FieldType::Date),
            ],
        )
        .keyed(&["service_id"])
        .editor_optional(),
        // service_id here deliberately has no foreign key: a feed may
        // define a service through calendar_dates alone.
        TableDef::new(
            "calendar_dates",
            vec![
                req("service_id", FieldType::Id),
                req("date", FieldType::Date),
                req("exception_type", FieldType::Integer),
            ],
        )
        .keyed(&["service_id", "date"])
        .editor_optional(),
        TableDef::new(
            "fare_attributes",
            vec![
                req("fare_id", FieldType::Id),
                req("price", FieldType::Double),
                req("currency_type", FieldType::Text),
                field("payment_method", FieldType::Integer),
                field("transfers", FieldType::Integer),
                field("transfer_duration", FieldType::Integer),
            ],
        )
        .keyed(&["fare_id"]),
        TableDef::new(
            "feed_info",
            vec![
                req("feed_publisher_name", FieldType::Text),
                req("feed_publisher_url", FieldType::Text),
                req("feed_lang", FieldType::Text),
                field("feed_start_date", FieldType::Date),
                field("feed_end_date", FieldType::Date),
                field("feed_version", FieldType::Text),
            ],
        ),
        TableDef::new(
            "routes",
            vec![
                req("route_id", FieldType::Id),
                fk(field("agency_id", FieldType::Id), "agency", "agency_id"),
                field("route_short_name", FieldType::Text),
                field("route_long_name", FieldType::Text),
                field("route_desc", FieldType::Text),
                req("route_type", FieldType::Integer),
                field("route_url", FieldType::Text),
                field("route_color", FieldType::Text),
                field("route_text_color", FieldType::Text),
            ],
        )
        .required()
        .keyed(&["route_id"]),
        TableDef::new(
            "fare_rules",
            vec![
                fk(req("fare_id", FieldType::Id), "fare_attributes", "fare_id"),
                fk(field("route_id", FieldType::Id), "routes", "route_id"),
                field("origin_id", FieldType::Id),
                field("destination_id", FieldType::Id),
                field("contains_id", FieldType::Id),
            ],
        ),
        TableDef::new(
            "shapes",
            vec![
                req("shape_id", FieldType::Id),
                req("shape_pt_lat", FieldType::Double),
                req("shape_pt_lon", FieldType::Double),
                req("shape_pt_sequence", FieldType::Integer),
                field("shape_dist_traveled", FieldType::Double),
            ],
        )
        .keyed(&["shape_id", "shape_pt_sequence"]),
        TableDef::new(
            "stops",
            vec![
                req("stop_id", FieldType::Id),
                field("stop_code", FieldType::Text),
                req("stop_name", FieldType::Text),
                field("stop_desc", FieldType::Text),
                field("stop_lat", FieldType::Double),
                field("stop_lon", FieldType::Double),
                field("zone_id", FieldType::Id),
                field("stop_url", FieldType::Text),
                field("location_type", FieldType::Integer),
                fk(field("parent_station", FieldType::Id), "stops", "stop_id"),
                field("stop_timezone", FieldType::Text),
                field("wheelchair_boarding", FieldType::Integer),
            ],
        )
        .required()
        .keyed(&["stop_id"]),
        TableDef::new(
            "trips",
            vec![
                req("trip_id", FieldType::Id),
                fk(req("route_id", FieldType::Id), "routes", "route_id"),
                req("service_id", FieldType::Id),
                field("trip_headsign", FieldType::Text),
                field("trip_short_name", FieldType::Text),
                field("direction_id", FieldType::Integer),
                field("block_id", FieldType::Id),
                fk(field("shape_id", FieldType::Id), "shapes", "shape_id"),
                field("bikes_allowed", FieldType::Integer),
                field("wheelchair_accessible", FieldType::Integer),
            ],
        )
        .required()
        .keyed(&["trip_id"]),
        TableDef::new(
            "frequencies",
            vec![
                fk(req("trip_id", FieldType::Id), "trips", "trip_id"),
                req("start_time", FieldType::Time),
                req("end_time", FieldType::Time),
                req("headway_secs", FieldType::Integer),
                field("exact_times", FieldType::Integer),
            ],
        )
        .keyed(&["trip_id", "start_time"]),
        TableDef::new(
            "stop_times",
            vec![
                fk(req("trip_id", FieldType::Id), "trips", "trip_id"),
                field("arrival_time", FieldType::Time),
                field("departure_time", FieldType::Time),
                fk(req("stop_id", FieldType::Id), "stops", "stop_id"),
                req("stop_sequence", FieldType::Integer),
                field("stop_headsign", FieldType::Text),
                field("pickup_type", FieldType::Integer),
                field("drop_off_type", FieldType::Integer),
                field("shape_dist_traveled", FieldType::Double),
                field("timepoint", FieldType::Integer),
            ],
        )
        .required()
        .keyed(&["trip_id", "stop_sequence"])
        .sequenced("trip_id", "stop_sequence"),
        TableDef::new(
            "transfers",
            vec![
                fk(req("from_stop_id", FieldType::Id), "stops", "stop_id"),
                fk(req("to_stop_id", FieldType::Id), "stops", "stop_id"),
                req("transfer_type", FieldType::Integer),
                field("min_transfer_time", FieldType::Integer),
            ],
        ),
        TableDef::new(
            "schedule_exceptions",
            vec![
                req("name", FieldType::Text),
                req("dates", FieldType::Text),
                req("exemplar", FieldType::Integer),
                field("custom_schedule", FieldType::Text),
                field("added_service", FieldType::Text),
                field("removed_service", FieldType::Text),
            ],
        )
        .keyed(&["name"])
        .editor_only(),
    ];
}

/// Looks a table definition up by name.
pub fn table(name: &str) -> Option<&'static TableDef> {
    TABLES.iter().find(|t| t.name == name)
}

/// Iterates all table definitions in dependency order.
pub fn tables() -> impl Iterator<Item = &'static TableDef> {
    TABLES.iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_in_dependency_order() {
        let position = |name: &str| TABLES.iter().position(|t| t.name == name).unwrap();
        for (i, table) in TABLES.iter().enumerate() {
            for field in &table.fields {
                if let Some((target, _)) = field.references {
                    assert!(
                        position(target) <= i,
                        "{} references {} before it is defined",
                        table.name,
                        target
                    );
                }
            }
        }
    }

    #[test]
    fn key_and_sequence_fields_exist() {
        for table in tables() {
            for key in table.key_fields {
                assert!(table.field(key).is_some(), "{}.{}", table.name, key);
            }
            if let Some(seq) = &table.sequence {
                assert!(table.field(seq.partition).is_some());
                assert!(table.field(seq.field).is_some());
            }
        }
    }

    #[test]
    fn parse_time_handles_post_midnight_hours() {
        assert_eq!(Ok(25200), parse_time("07:00:00"));
        assert_eq!(Ok(26 * 3600 + 600), parse_time("26:10:00"));
        assert_eq!(Ok(3661), parse_time("1:01:01"));
        assert!(parse_time("7:00").is_err());
        assert!(parse_time("07:61:00").is_err());
        assert!(parse_time("").is_err());
    }

    #[test]
    fn time_round_trips_through_format() {
        for raw in ["07:00:00", "26:10:00", "00:00:00"] {
            assert_eq!(raw, format_time(parse_time(raw).unwrap()));
        }
    }

    #[test]
    fn date_ingest_validates_calendar_days() {
        assert_eq!(Ok(20170915), parse_date("20170915"));
        assert!(parse_date("20170231").is_err());
        assert!(parse_date("September").is_err());
    }

    #[test]
    fn null_emits_as_empty_string() {
        for ty in [
            FieldType::Text,
            FieldType::Integer,
            FieldType::Double,
            FieldType::Date,
            FieldType::Time,
        ] {
            assert_eq!("", ty.emit(&Value::Null));
        }
    }
}
