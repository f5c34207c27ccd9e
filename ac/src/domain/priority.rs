//! Priority and queue-class levels for admission ordering

use serde::{Deserialize, Serialize};

/// Priority level for delegated work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    /// Numeric rank, lower pops earlier
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
            Self::Background => write!(f, "background"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Admission class, orthogonal to priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Interactive,
    #[default]
    Standard,
    Batch,
}

impl QueueClass {
    /// Numeric rank, lower pops earlier
    pub fn rank(self) -> u8 {
        match self {
            Self::Interactive => 0,
            Self::Standard => 1,
            Self::Batch => 2,
        }
    }
}

impl std::fmt::Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Standard => write!(f, "standard"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

impl std::str::FromStr for QueueClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "standard" => Ok(Self::Standard),
            "batch" => Ok(Self::Batch),
            _ => Err(format!("Unknown queue class: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_ordering() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert!(Priority::Low.rank() < Priority::Background.rank());
    }

    #[test]
    fn test_priority_display_parse() {
        for p in [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Background,
        ] {
            assert_eq!(p.to_string().parse::<Priority>().unwrap(), p);
        }
        assert!("invalid".parse::<Priority>().is_err());
    }

    #[test]
    fn test_queue_class_rank() {
        assert!(QueueClass::Interactive.rank() < QueueClass::Standard.rank());
        assert!(QueueClass::Standard.rank() < QueueClass::Batch.rank());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::Background).unwrap(), "\"background\"");
        assert_eq!(
            serde_json::from_str::<QueueClass>("\"interactive\"").unwrap(),
            QueueClass::Interactive
        );
    }
}
