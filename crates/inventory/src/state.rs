use core::fmt;

use serde::{Deserialize, Serialize};

use shopfloor_core::{DomainError, DomainResult, ValueObject};

/// Name of a manufacturing process that holds its own WIP bucket.
///
/// Normalised to lowercase; only `a-z`, `0-9`, `_` and `-` are allowed so the
/// name is safe to use as a read-model column suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessName(String);

impl ValueObject for ProcessName {}

impl ProcessName {
    /// Processes every plant starts with. Other names are accepted too.
    pub const STANDARD: &'static [&'static str] = &[
        "cutting",
        "bending",
        "welding",
        "zinc",
        "painting",
        "assembly",
        "machining",
        "polishing",
    ];

    pub fn new(name: impl AsRef<str>) -> DomainResult<Self> {
        let normalized = name.as_ref().trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DomainError::validation("process name cannot be empty"));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
        {
            return Err(DomainError::validation(format!(
                "process name '{normalized}' contains invalid character '{bad}'"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_standard(&self) -> bool {
        Self::STANDARD.contains(&self.0.as_str())
    }
}

impl TryFrom<String> for ProcessName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ProcessName::new(value)
    }
}

impl From<ProcessName> for String {
    fn from(value: ProcessName) -> Self {
        value.0
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State bucket of an item's (or batch's) stock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockState {
    Raw,
    Wip(ProcessName),
    Finished,
    Scrap,
}

impl StockState {
    pub fn wip(process: &ProcessName) -> Self {
        StockState::Wip(process.clone())
    }
}

impl fmt::Display for StockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StockState::Raw => f.write_str("raw"),
            StockState::Wip(p) => write!(f, "wip:{p}"),
            StockState::Finished => f.write_str("finished"),
            StockState::Scrap => f.write_str("scrap"),
        }
    }
}

/// States that may receive stock from outside the ledger.
///
/// Production output lands in finished. Purchases land in raw unless the
/// order line names another destination, e.g. bought-in parts that go straight
/// to a process or to finished goods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptState {
    #[default]
    Raw,
    Wip(ProcessName),
    Finished,
    Scrap,
}

impl From<ReceiptState> for StockState {
    fn from(value: ReceiptState) -> Self {
        match value {
            ReceiptState::Raw => StockState::Raw,
            ReceiptState::Wip(p) => StockState::Wip(p),
            ReceiptState::Finished => StockState::Finished,
            ReceiptState::Scrap => StockState::Scrap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_names_are_normalised() {
        let p = ProcessName::new("  Cutting ").unwrap();
        assert_eq!(p.as_str(), "cutting");
        assert!(p.is_standard());
        assert!(!ProcessName::new("laser_etch").unwrap().is_standard());
    }

    #[test]
    fn invalid_process_names_are_rejected() {
        assert!(ProcessName::new("").is_err());
        assert!(ProcessName::new("powder coat").is_err());
        assert!(ProcessName::new("zinc;drop").is_err());
    }

    #[test]
    fn receipt_states_map_onto_stock_states() {
        let zinc = ProcessName::new("zinc").unwrap();
        assert_eq!(StockState::from(ReceiptState::default()), StockState::Raw);
        assert_eq!(StockState::from(ReceiptState::Wip(zinc.clone())), StockState::wip(&zinc));
        assert_eq!(StockState::from(ReceiptState::Scrap), StockState::Scrap);

        let json = serde_json::to_string(&ReceiptState::Wip(zinc)).unwrap();
        assert_eq!(json, r#"{"wip":"zinc"}"#);
    }

    #[test]
    fn wip_state_serializes_with_process() {
        let state = StockState::wip(&ProcessName::new("welding").unwrap());
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"wip":"welding"}"#);
        assert_eq!(state.to_string(), "wip:welding");

        let raw = serde_json::to_string(&StockState::Raw).unwrap();
        assert_eq!(raw, r#""raw""#);
    }
}
