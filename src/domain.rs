use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub const DEFAULT_GROWTH_DIM: &str = "time";

pub const SST_VARIABLES: &[&str] = &[
    "time",
    "lat",
    "lon",
    "dt_analysis",
    "l2p_flags",
    "quality_level",
    "satellite_zenith_angle",
    "sea_surface_temperature",
    "sses_bias",
    "sses_count",
    "sses_standard_deviation",
    "sst_dtime",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    File,
    Memory,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Memory => "memory",
        }
    }
}

/// A backend-qualified object location, e.g. `file:///data/sst/2022/a.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    scheme: Scheme,
    key: String,
}

pub type SourceLocation = Location;

impl Location {
    pub fn new(scheme: Scheme, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            scheme,
            key: key.trim_matches('/').to_string(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::File => write!(f, "file:///{}", self.key),
            Scheme::Memory => write!(f, "memory://{}", self.key),
        }
    }
}

impl FromStr for Location {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(IngestError::InvalidLocation("empty location".to_string()));
        }
        let Some((scheme, rest)) = value.split_once("://") else {
            return local_path(value);
        };
        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                if !rest.starts_with('/') {
                    return Err(IngestError::InvalidLocation(format!(
                        "{value}: file locations must be absolute"
                    )));
                }
                Ok(Self::new(Scheme::File, rest))
            }
            "memory" | "mem" => Ok(Self::new(Scheme::Memory, rest)),
            other => Err(IngestError::InvalidLocation(format!(
                "{value}: unsupported storage backend `{other}`"
            ))),
        }
    }
}

fn local_path(value: &str) -> Result<Location, IngestError> {
    let path = std::path::Path::new(value);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| IngestError::InvalidLocation(format!("{value}: {err}")))?
            .join(path)
    };
    let absolute = Utf8PathBuf::from_path_buf(absolute)
        .map_err(|_| IngestError::InvalidLocation(format!("{value}: path is not UTF-8")))?;
    Ok(Location::new(Scheme::File, absolute.as_str().replace('\\', "/")))
}

impl Serialize for Location {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableAllowList(BTreeSet<String>);

impl VariableAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn sst() -> Self {
        Self::new(SST_VARIABLES.iter().copied())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for VariableAllowList {
    fn default() -> Self {
        Self::sst()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkGeometry(BTreeMap<String, usize>);

impl ChunkGeometry {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self(
            entries
                .into_iter()
                .map(|(dim, len)| (dim.into(), len))
                .collect(),
        )
    }

    pub fn get(&self, dim: &str) -> Option<usize> {
        self.0.get(dim).copied()
    }

    pub fn set(&mut self, dim: impl Into<String>, len: usize) {
        self.0.insert(dim.into(), len);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(dim, len)| (dim.as_str(), *len))
    }

    // The growth dimension keeps its configured length so every batch agrees.
    pub fn chunk_len(&self, dim: &str, size: usize, growth_dim: &str) -> usize {
        match self.get(dim) {
            Some(len) if dim == growth_dim => len,
            Some(len) => len.min(size).max(1),
            None => size.max(1),
        }
    }
}

impl Default for ChunkGeometry {
    fn default() -> Self {
        Self::new([("time", 10), ("lat", 1500), ("lon", 1500)])
    }
}

pub fn parse_chunk_entry(value: &str) -> Result<(String, usize), IngestError> {
    let (dim, len) = value
        .split_once('=')
        .ok_or_else(|| IngestError::InvalidConfig(format!("expected dim=len, got `{value}`")))?;
    let len = len
        .trim()
        .parse::<usize>()
        .map_err(|_| IngestError::InvalidConfig(format!("invalid chunk length in `{value}`")))?;
    let dim = dim.trim();
    if dim.is_empty() {
        return Err(IngestError::InvalidConfig(format!(
            "missing dimension name in `{value}`"
        )));
    }
    Ok((dim.to_string(), len))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the run on the first permanent per-file failure.
    FailFast,
    /// Keep going with the files that could be read and report the rest.
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FirstBatchPolicy {
    CreateFromPartial,
    RequireComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Create,
    Append,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Create => write!(f, "create"),
            WriteMode::Append => write!(f, "append"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub locations: Vec<SourceLocation>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_roundtrips_through_display() {
        let loc: Location = "file:///data/sst/2022/a.json".parse().unwrap();
        assert_eq!(loc.scheme(), Scheme::File);
        assert_eq!(loc.key(), "data/sst/2022/a.json");
        assert_eq!(loc.to_string(), "file:///data/sst/2022/a.json");
    }

    #[test]
    fn growth_chunk_is_not_clipped() {
        let geometry = ChunkGeometry::new([("time", 10), ("lat", 1500)]);
        assert_eq!(geometry.chunk_len("time", 3, "time"), 10);
        assert_eq!(geometry.chunk_len("lat", 4, "time"), 4);
        assert_eq!(geometry.chunk_len("lon", 7, "time"), 7);
    }
}
