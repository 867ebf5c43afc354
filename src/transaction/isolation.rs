//! Transaction isolation levels.
//!
//! The engine never interprets these itself; the level is handed to the
//! link's session right after BEGIN. [`IsolationLevel::Default`] leaves the
//! driver's own default in place and issues nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Whatever the driver or server uses when nothing is configured.
    #[default]
    Default,

    /// Reads may see uncommitted writes of other transactions.
    ReadUncommitted,

    /// Each read sees the latest committed data at the time of the read.
    ReadCommitted,

    /// All reads see a snapshot taken at the first read.
    RepeatableRead,

    /// Transactions behave as if run one after another.
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword for `SET TRANSACTION ISOLATION LEVEL`, or `None` for the
    /// driver default.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql().unwrap_or("DEFAULT"))
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('_', " ").as_str() {
            "DEFAULT" | "" => Ok(IsolationLevel::Default),
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" | "SNAPSHOT" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::Default);
        assert_eq!(IsolationLevel::Default.as_sql(), None);
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "Serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("chaos".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&IsolationLevel::ReadUncommitted).unwrap();
        assert_eq!(json, "\"READ_UNCOMMITTED\"");
        let level: IsolationLevel = serde_json::from_str("\"SERIALIZABLE\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }
}
