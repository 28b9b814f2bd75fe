use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

static FORM_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").unwrap());

/// Stable identity assigned by the form author.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormId(String);

impl FormId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FormId {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !FORM_ID_RE.is_match(normalized) {
            return Err(CatalogError::InvalidFormId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for FormId {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FormId> for String {
    fn from(value: FormId) -> Self {
        value.0
    }
}

/// Author-declared version of a form. `None` means unversioned.
///
/// Ordering is total: unversioned sorts lowest, then plain unsigned integers by
/// value, then every other version lexically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormVersion(Option<String>);

impl FormVersion {
    pub fn unversioned() -> Self {
        Self(None)
    }

    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Self(None)
        } else {
            Self(Some(trimmed.to_string()))
        }
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_unversioned(&self) -> bool {
        self.0.is_none()
    }

    /// Accepts the shapes authors actually write: strings, integers, or nothing.
    pub fn from_json(value: Option<&Value>) -> Result<Self, CatalogError> {
        match value {
            None | Some(Value::Null) => Ok(Self::unversioned()),
            Some(Value::String(text)) => Ok(Self::new(text.as_str())),
            Some(Value::Number(number)) => Ok(Self::new(number.to_string())),
            Some(other) => Err(CatalogError::Parse(format!(
                "unsupported version value: {other}"
            ))),
        }
    }
}

impl Ord for FormVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(left), Some(right)) => match (numeric(left), numeric(right)) {
                (Some(l), Some(r)) => l.cmp(&r).then_with(|| left.cmp(right)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => left.cmp(right),
            },
        }
    }
}

fn numeric(version: &str) -> Option<u128> {
    if version.bytes().all(|byte| byte.is_ascii_digit()) {
        version.parse().ok()
    } else {
        None
    }
}

impl PartialOrd for FormVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FormVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(version) => write!(f, "{version}"),
            None => write!(f, "unversioned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    #[default]
    NameAsc,
    NameDesc,
    DateAsc,
    DateDesc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::NameAsc => write!(f, "name-asc"),
            SortOrder::NameDesc => write!(f, "name-desc"),
            SortOrder::DateAsc => write!(f, "date-asc"),
            SortOrder::DateDesc => write!(f, "date-desc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    DiskScan,
    CatalogSync,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::DiskScan => write!(f, "disk-scan"),
            TaskKind::CatalogSync => write!(f, "catalog-sync"),
        }
    }
}

/// Identity and title read from the top of a form definition document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormHeader {
    pub form_id: FormId,
    pub version: FormVersion,
    pub title: String,
}

/// Parses a form definition far enough to identify it.
///
/// A definition is a JSON object carrying at least `formId`. `version` is
/// optional; `title` falls back to the form id when absent or blank.
pub fn parse_form_header(bytes: &[u8]) -> Result<FormHeader, CatalogError> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|err| CatalogError::Parse(format!("form definition is not JSON: {err}")))?;
    let object = raw
        .as_object()
        .ok_or_else(|| CatalogError::Parse("form definition must be a JSON object".to_string()))?;

    let form_id = object
        .get("formId")
        .and_then(|value| value.as_str())
        .ok_or_else(|| CatalogError::Parse("form definition has no formId".to_string()))?
        .parse::<FormId>()
        .map_err(|err| CatalogError::Parse(err.to_string()))?;
    let version = FormVersion::from_json(object.get("version"))?;
    let title = object
        .get("title")
        .and_then(|value| value.as_str())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .unwrap_or_else(|| form_id.to_string());

    Ok(FormHeader {
        form_id,
        version,
        title,
    })
}
