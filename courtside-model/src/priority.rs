use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Collection urgency tier. Declaration order is dispatch order, so the
/// derived `Ord` puts `Immediate` first.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
#[repr(u8)]
pub enum Priority {
    #[cfg_attr(feature = "serde", serde(alias = "immediate"))]
    Immediate = 0,
    #[cfg_attr(feature = "serde", serde(alias = "high"))]
    High = 1,
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "medium"))]
    Medium = 2,
    #[cfg_attr(feature = "serde", serde(alias = "low"))]
    Low = 3,
    #[cfg_attr(feature = "serde", serde(alias = "execute"))]
    Execute = 4,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Immediate,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Execute,
    ];

    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Returns whichever tier dispatches first.
    pub fn elevate(self, other: Priority) -> Priority {
        self.min(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Immediate => "IMMEDIATE",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Execute => "EXECUTE",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IMMEDIATE" => Ok(Priority::Immediate),
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            "EXECUTE" => Ok(Priority::Execute),
            other => Err(ModelError::InvalidPriority(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_sort_in_dispatch_order() {
        let mut tiers = vec![
            Priority::Low,
            Priority::Execute,
            Priority::Immediate,
            Priority::Medium,
            Priority::High,
        ];
        tiers.sort();
        assert_eq!(tiers, Priority::ALL.to_vec());
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" EXECUTE ".parse::<Priority>().unwrap(), Priority::Execute);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn elevate_keeps_more_urgent_tier() {
        assert_eq!(Priority::Low.elevate(Priority::High), Priority::High);
        assert_eq!(Priority::High.elevate(Priority::Low), Priority::High);
    }
}
