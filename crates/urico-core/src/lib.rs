//! Core domain model for URICO: generation targets, master geography, and record shapes.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "urico-core";

/// Keys every hidden-detail generation record must carry.
pub const REQUIRED_KEYS: [&str; 9] = [
    "id",
    "type",
    "scope",
    "area",
    "city",
    "rail_company",
    "line",
    "station",
    "timing",
];

/// Buyer detail keys withheld until contact; their presence rejects a record.
pub const FORBIDDEN_KEYS: [&str; 9] = [
    "price",
    "walk_time",
    "family",
    "occupation",
    "age",
    "land_area",
    "reason",
    "ng",
    "parking",
];

pub const MIN_RECORDS: usize = 16;
pub const MAX_RECORDS: usize = 63;

pub const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const HIDDEN_DETAIL_SCHEMA: &str = "hidden-detail/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    House,
    Land,
}

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::House, DataKind::Land];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::House => "house",
            DataKind::Land => "land",
        }
    }

    /// Fixed `type` value every generated record of this kind must carry.
    pub fn type_label(self) -> &'static str {
        match self {
            DataKind::House => "戸建",
            DataKind::Land => "土地",
        }
    }

    /// Variable name of the array assignment the generator is asked to emit.
    pub fn db_marker(self) -> &'static str {
        match self {
            DataKind::House => "house_db",
            DataKind::Land => "land_db",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "house" => Ok(DataKind::House),
            "land" => Ok(DataKind::Land),
            other => Err(format!("unknown data kind `{other}` (expected house or land)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Area,
    Station,
}

impl Axis {
    pub fn as_str(self) -> &'static str {
        match self {
            Axis::Area => "area",
            Axis::Station => "station",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "area" => Ok(Axis::Area),
            "station" => Ok(Axis::Station),
            other => Err(format!("unknown axis `{other}` (expected area or station)")),
        }
    }
}

/// Geography half of a target. The variant is the axis, so a target can never
/// carry both area and station fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "axis", rename_all = "lowercase")]
pub enum Location {
    Area {
        prefecture: String,
        city: String,
    },
    Station {
        rail_company: String,
        line: String,
        station: String,
    },
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub kind: DataKind,
    #[serde(flatten)]
    pub location: Location,
}

impl Target {
    pub fn area(kind: DataKind, prefecture: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            kind,
            location: Location::Area {
                prefecture: prefecture.into(),
                city: city.into(),
            },
        }
    }

    pub fn station(
        kind: DataKind,
        rail_company: impl Into<String>,
        line: impl Into<String>,
        station: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            location: Location::Station {
                rail_company: rail_company.into(),
                line: line.into(),
                station: station.into(),
            },
        }
    }

    pub fn axis(&self) -> Axis {
        match self.location {
            Location::Area { .. } => Axis::Area,
            Location::Station { .. } => Axis::Station,
        }
    }

    /// Run-log label: `pref > city` or `rail > line > station`.
    pub fn label(&self) -> String {
        match &self.location {
            Location::Area { prefecture, city } => format!("{prefecture} > {city}"),
            Location::Station {
                rail_company,
                line,
                station,
            } => format!("{rail_company} > {line} > {station}"),
        }
    }

    /// Stable identity used for deduplication across logs and events.
    pub fn key(&self) -> String {
        match &self.location {
            Location::Area { prefecture, city } => {
                format!("{}:area:{prefecture}/{city}", self.kind)
            }
            Location::Station {
                rail_company,
                line,
                station,
            } => format!("{}:station:{rail_company}/{line}/{station}", self.kind),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.kind, self.axis(), self.label())
    }
}

#[derive(Debug, Error)]
pub enum GeographyError {
    #[error("reading master geography {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing master geography: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("prefecture `{0}` not found in master geography")]
    UnknownPrefecture(String),
    #[error("city `{city}` not found in prefecture `{prefecture}`")]
    UnknownCity { prefecture: String, city: String },
    #[error("station `{station}` not found on `{rail_company} > {line}`")]
    UnknownStation {
        rail_company: String,
        line: String,
        station: String,
    },
}

/// rail company -> line -> ordered stations, in master-file order
pub type RailNetwork = IndexMap<String, IndexMap<String, Vec<String>>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prefecture {
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default)]
    pub rail: RailNetwork,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MasterDocument {
    Wrapped {
        prefectures: IndexMap<String, Prefecture>,
    },
    Bare(IndexMap<String, Prefecture>),
}

/// Read-only prefecture -> cities / rail tree, kept in file order so batch
/// numbering matches the master document. Loaded once per process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterGeography {
    prefectures: IndexMap<String, Prefecture>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetFilter {
    pub prefecture: Option<String>,
    /// `None` enumerates both axes, area targets first.
    pub axis: Option<Axis>,
}

impl MasterGeography {
    pub fn new(prefectures: IndexMap<String, Prefecture>) -> Self {
        Self { prefectures }
    }

    /// Accepts both the bare prefecture map and the `{ "prefectures": ... }` wrapper.
    pub fn from_json_str(text: &str) -> Result<Self, GeographyError> {
        let prefectures = match serde_json::from_str(text)? {
            MasterDocument::Wrapped { prefectures } => prefectures,
            MasterDocument::Bare(prefectures) => prefectures,
        };
        Ok(Self { prefectures })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeographyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GeographyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn prefectures(&self) -> impl Iterator<Item = (&str, &Prefecture)> {
        self.prefectures.iter().map(|(name, p)| (name.as_str(), p))
    }

    pub fn prefecture(&self, name: &str) -> Option<&Prefecture> {
        self.prefectures.get(name)
    }

    pub fn cities_of(&self, prefecture: &str) -> Option<&[String]> {
        self.prefectures.get(prefecture).map(|p| p.cities.as_slice())
    }

    /// Stations of a line, taken from the first prefecture that lists it.
    pub fn stations_on(&self, rail_company: &str, line: &str) -> Option<&[String]> {
        self.prefectures.values().find_map(|p| {
            p.rail
                .get(rail_company)
                .and_then(|lines| lines.get(line))
                .map(Vec::as_slice)
        })
    }

    pub fn validate(&self, target: &Target) -> Result<(), GeographyError> {
        self.allow_list(target).map(|_| ())
    }

    /// Sibling names a generator may emit for `target`: every city of the
    /// prefecture, or every station of the line the target's station is on.
    pub fn allow_list(&self, target: &Target) -> Result<&[String], GeographyError> {
        match &target.location {
            Location::Area { prefecture, city } => {
                let cities = self
                    .cities_of(prefecture)
                    .ok_or_else(|| GeographyError::UnknownPrefecture(prefecture.clone()))?;
                if !cities.iter().any(|c| c == city) {
                    return Err(GeographyError::UnknownCity {
                        prefecture: prefecture.clone(),
                        city: city.clone(),
                    });
                }
                Ok(cities)
            }
            Location::Station {
                rail_company,
                line,
                station,
            } => {
                // A line spanning prefectures is listed once per prefecture; the
                // station may sit in any of those segments.
                self.prefectures
                    .values()
                    .filter_map(|p| p.rail.get(rail_company).and_then(|l| l.get(line)))
                    .find(|stations| stations.iter().any(|s| s == station))
                    .map(Vec::as_slice)
                    .ok_or_else(|| GeographyError::UnknownStation {
                        rail_company: rail_company.clone(),
                        line: line.clone(),
                        station: station.clone(),
                    })
            }
        }
    }

    /// Expand the tree into a flat, deterministic target list. A filter naming
    /// no known prefecture yields an empty list.
    pub fn enumerate(&self, kind: DataKind, filter: &TargetFilter) -> Vec<Target> {
        let selected = || {
            self.prefectures
                .iter()
                .filter(|(name, _)| filter.prefecture.as_deref().map_or(true, |f| f == name.as_str()))
        };
        let mut targets = Vec::new();

        if filter.axis.map_or(true, |a| a == Axis::Area) {
            for (pref_name, pref) in selected() {
                for city in &pref.cities {
                    targets.push(Target::area(kind, pref_name.clone(), city.clone()));
                }
            }
        }

        if filter.axis.map_or(true, |a| a == Axis::Station) {
            let mut seen = HashSet::new();
            for (_, pref) in selected() {
                for (rail_company, lines) in &pref.rail {
                    for (line, stations) in lines {
                        for station in stations {
                            let target =
                                Target::station(kind, rail_company.clone(), line.clone(), station.clone());
                            if seen.insert(target.key()) {
                                targets.push(target);
                            }
                        }
                    }
                }
            }
        }

        targets
    }
}

/// Stamp every record with the hidden-detail schema tag before it is persisted.
pub fn stamp_schema_version(records: &mut [JsonValue]) {
    for record in records {
        if let Some(obj) = record.as_object_mut() {
            obj.insert(
                SCHEMA_VERSION_KEY.to_string(),
                JsonValue::String(HIDDEN_DETAIL_SCHEMA.to_string()),
            );
        }
    }
}

/// Buyer sub-record of a display bundle entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerEntry {
    pub price: String,
    pub method: String,
    pub occupation: String,
    pub reason: String,
    pub timing: String,
    pub ng: String,
    pub family: String,
    pub age: String,
}

/// Display-ready property (or station catchment) with its interested buyers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    /// Buyer detail is withheld until contact.
    #[serde(default)]
    pub details_hidden: bool,
    pub buyers: Vec<BuyerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleEntry {
    Reshaped(BundleRecord),
    /// Input that was already in display shape.
    Passthrough(JsonValue),
}

impl BundleEntry {
    pub fn buyer_count(&self) -> usize {
        match self {
            BundleEntry::Reshaped(record) => record.buyers.len(),
            BundleEntry::Passthrough(value) => value
                .get("buyers")
                .and_then(JsonValue::as_array)
                .map_or(0, Vec::len),
        }
    }
}
