//! Thirteen-field coordinates locating points in the knowledge space.
//!
//! A [`Coordinate`] addresses a cell in the shared memory graph. It is an
//! ordered tuple of thirteen typed fields with a fixed pipe-separated
//! encoding:
//!
//! ```text
//! pillar|sector|honeycomb|branch|node|regulatory|compliance|
//! role_knowledge|role_sector|role_regulatory|role_compliance|
//! location|temporal
//! ```
//!
//! `honeycomb` holds zero or more crosswalk tags, comma-separated within
//! its field. Empty fields encode as empty strings. Coordinate equality is
//! by canonical encoding; the coordinate hash is SHA-256 over that
//! encoding, so two lexically different spellings of the same code (for
//! example a zero-padded sector) hash identically.

use std::fmt;
use std::sync::LazyLock;

use miette::Diagnostic;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of fields in the pipe encoding.
pub const FIELD_COUNT: usize = 13;

static PILLAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PL\d{1,2}(\.\d+){0,2}$").expect("pillar pattern"));

static EVENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-\s_:]+$").expect("event id pattern"));

static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:\d{2})?)?$")
        .expect("iso date pattern")
});

/// Errors produced while parsing or validating coordinates.
#[derive(Debug, Error, Diagnostic)]
pub enum CoordinateError {
    /// Wrong number of pipe-separated fields.
    #[error("expected {FIELD_COUNT} pipe-separated fields, found {found}")]
    #[diagnostic(
        code(echelon::coordinate::field_count),
        help("The encoding is pillar|sector|honeycomb|branch|node|regulatory|compliance|role_knowledge|role_sector|role_regulatory|role_compliance|location|temporal.")
    )]
    FieldCount { found: usize },

    /// Pillar code does not match `PL<n>[.<n>[.<n>]]`.
    #[error("invalid pillar code: {value:?}")]
    #[diagnostic(
        code(echelon::coordinate::pillar),
        help("Pillar codes look like PL09 or PL12.3.1.")
    )]
    Pillar { value: String },

    /// Temporal field is neither an ISO-8601 date/datetime nor an event id.
    #[error("invalid temporal field: {value:?}")]
    #[diagnostic(
        code(echelon::coordinate::temporal),
        help("Use an ISO-8601 date/datetime or an event id of letters, digits, '-', '_', ':' and spaces.")
    )]
    Temporal { value: String },
}

/// A point in the thirteen-axis knowledge space.
///
/// Construct with [`Coordinate::builder`] and address memory cells with
/// it:
///
/// ```
/// use echelon::coordinate::Coordinate;
///
/// let coord = Coordinate::builder("PL09")
///     .sector("5415")
///     .honeycomb(["PL09.3.2"])
///     .location("US-CA")
///     .temporal("2025-01-01")
///     .build()
///     .unwrap();
/// assert_eq!(Coordinate::parse(&coord.encode()).unwrap(), coord);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub pillar: String,
    pub sector: String,
    pub honeycomb: Vec<String>,
    pub branch: String,
    pub node: String,
    pub regulatory: String,
    pub compliance: String,
    pub role_knowledge: String,
    pub role_sector: String,
    pub role_regulatory: String,
    pub role_compliance: String,
    pub location: String,
    pub temporal: String,
}

impl Coordinate {
    /// Start building a coordinate from its mandatory pillar code.
    pub fn builder(pillar: impl Into<String>) -> CoordinateBuilder {
        CoordinateBuilder::new(pillar)
    }

    /// The default placement for queries that arrive without one.
    pub fn origin() -> Self {
        Self::builder("PL01")
            .build()
            .expect("origin coordinate is statically valid")
    }

    /// Parse the pipe-separated encoding back into a coordinate.
    ///
    /// Total inverse of [`encode`](Self::encode) on valid input;
    /// ill-formed text is rejected before any hashing can occur.
    pub fn parse(encoded: &str) -> Result<Self, CoordinateError> {
        let fields: Vec<&str> = encoded.split('|').collect();
        if fields.len() != FIELD_COUNT {
            return Err(CoordinateError::FieldCount {
                found: fields.len(),
            });
        }
        let honeycomb = if fields[2].is_empty() {
            Vec::new()
        } else {
            fields[2].split(',').map(canonical_code).collect()
        };
        let coord = Coordinate {
            pillar: fields[0].trim().to_string(),
            sector: canonical_code(fields[1]),
            honeycomb,
            branch: canonical_code(fields[3]),
            node: canonical_code(fields[4]),
            regulatory: canonical_code(fields[5]),
            compliance: canonical_code(fields[6]),
            role_knowledge: fields[7].trim().to_string(),
            role_sector: fields[8].trim().to_string(),
            role_regulatory: fields[9].trim().to_string(),
            role_compliance: fields[10].trim().to_string(),
            location: fields[11].trim().to_string(),
            temporal: fields[12].trim().to_string(),
        };
        coord.validate()?;
        Ok(coord)
    }

    /// Validate pillar and temporal patterns.
    pub fn validate(&self) -> Result<(), CoordinateError> {
        if !PILLAR_RE.is_match(&self.pillar) {
            return Err(CoordinateError::Pillar {
                value: self.pillar.clone(),
            });
        }
        if !self.temporal.is_empty()
            && !ISO_DATE_RE.is_match(&self.temporal)
            && !EVENT_ID_RE.is_match(&self.temporal)
        {
            return Err(CoordinateError::Temporal {
                value: self.temporal.clone(),
            });
        }
        Ok(())
    }

    /// Render the canonical thirteen-field pipe encoding.
    pub fn encode(&self) -> String {
        [
            self.pillar.as_str(),
            self.sector.as_str(),
            &self.honeycomb.join(","),
            self.branch.as_str(),
            self.node.as_str(),
            self.regulatory.as_str(),
            self.compliance.as_str(),
            self.role_knowledge.as_str(),
            self.role_sector.as_str(),
            self.role_regulatory.as_str(),
            self.role_compliance.as_str(),
            self.location.as_str(),
            self.temporal.as_str(),
        ]
        .join("|")
    }

    /// SHA-256 over the canonical encoding, lowercase hex.
    ///
    /// This is the key under which the memory graph stores the live cell
    /// for this coordinate.
    pub fn hash(&self) -> String {
        sha256_hex(self.encode().as_bytes())
    }

    /// Unified system id: SHA-256 over `pillar|sector|location`.
    pub fn unified_system_id(&self) -> String {
        sha256_hex(format!("{}|{}|{}", self.pillar, self.sector, self.location).as_bytes())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Fluent constructor for [`Coordinate`].
#[derive(Debug, Default)]
pub struct CoordinateBuilder {
    pillar: String,
    sector: String,
    honeycomb: Vec<String>,
    branch: String,
    node: String,
    regulatory: String,
    compliance: String,
    role_knowledge: String,
    role_sector: String,
    role_regulatory: String,
    role_compliance: String,
    location: String,
    temporal: String,
}

impl CoordinateBuilder {
    fn new(pillar: impl Into<String>) -> Self {
        Self {
            pillar: pillar.into(),
            ..Default::default()
        }
    }

    pub fn sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = canonical_code(&sector.into());
        self
    }

    pub fn honeycomb<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.honeycomb = tags
            .into_iter()
            .map(|t| canonical_code(&t.into()))
            .collect();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = canonical_code(&branch.into());
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = canonical_code(&node.into());
        self
    }

    pub fn regulatory(mut self, regulatory: impl Into<String>) -> Self {
        self.regulatory = canonical_code(&regulatory.into());
        self
    }

    pub fn compliance(mut self, compliance: impl Into<String>) -> Self {
        self.compliance = canonical_code(&compliance.into());
        self
    }

    pub fn role_knowledge(mut self, role: impl Into<String>) -> Self {
        self.role_knowledge = role.into();
        self
    }

    pub fn role_sector(mut self, role: impl Into<String>) -> Self {
        self.role_sector = role.into();
        self
    }

    pub fn role_regulatory(mut self, role: impl Into<String>) -> Self {
        self.role_regulatory = role.into();
        self
    }

    pub fn role_compliance(mut self, role: impl Into<String>) -> Self {
        self.role_compliance = role.into();
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn temporal(mut self, temporal: impl Into<String>) -> Self {
        self.temporal = temporal.into();
        self
    }

    pub fn build(self) -> Result<Coordinate, CoordinateError> {
        let coord = Coordinate {
            pillar: self.pillar.trim().to_string(),
            sector: self.sector,
            honeycomb: self.honeycomb,
            branch: self.branch,
            node: self.node,
            regulatory: self.regulatory,
            compliance: self.compliance,
            role_knowledge: self.role_knowledge,
            role_sector: self.role_sector,
            role_regulatory: self.role_regulatory,
            role_compliance: self.role_compliance,
            location: self.location,
            temporal: self.temporal,
        };
        coord.validate()?;
        Ok(coord)
    }
}

/// Canonicalize a short code field.
///
/// Numeric codes normalize so that `007`, `7` and `7.0` all key the same
/// cell; non-numeric codes are trimmed and kept verbatim.
fn canonical_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return int.to_string();
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if float.fract() == 0.0 && float.is_finite() && float.abs() < 9.0e15 {
            return (float as i64).to_string();
        }
    }
    trimmed.to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
