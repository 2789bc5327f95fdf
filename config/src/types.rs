//! Run-type selector and wall-clock limit types.

use serde::{Deserialize, Serialize};

/// Operating mode forwarded to the training entry point via `--run-type`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    #[default]
    Train,
    Eval,
    Inference,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Eval => write!(f, "eval"),
            Self::Inference => write!(f, "inference"),
        }
    }
}

impl std::str::FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "eval" => Ok(Self::Eval),
            "inference" => Ok(Self::Inference),
            _ => Err(format!(
                "unknown run type '{s}'. Use: train, eval, inference"
            )),
        }
    }
}

/// Wall-clock limit in the LSF `-W` format.
///
/// Accepts `HH:MM` (as the submission scripts write it) or a bare number of
/// minutes. Stored as total minutes, displayed as `HH:MM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallTime(u32);

impl WallTime {
    /// Construct from total minutes.
    pub fn from_minutes(minutes: u32) -> Self {
        Self(minutes)
    }

    /// Total minutes.
    pub fn minutes(self) -> u32 {
        self.0
    }
}

impl Default for WallTime {
    fn default() -> Self {
        // 24:00, the most common profile in the submission scripts
        Self(24 * 60)
    }
}

impl std::str::FromStr for WallTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty wall-time".to_string());
        }
        if let Some((hours_str, mins_str)) = s.split_once(':') {
            let hours: u32 = hours_str
                .parse()
                .map_err(|_| format!("invalid hours '{hours_str}' in wall-time '{s}'"))?;
            let mins: u32 = mins_str
                .parse()
                .map_err(|_| format!("invalid minutes '{mins_str}' in wall-time '{s}'"))?;
            if mins >= 60 {
                return Err(format!("minutes must be < 60 in wall-time '{s}'"));
            }
            let total = hours * 60 + mins;
            if total == 0 {
                return Err(format!("wall-time '{s}' must be non-zero"));
            }
            Ok(Self(total))
        } else {
            let total: u32 = s
                .parse()
                .map_err(|_| format!("invalid wall-time '{s}'. Use HH:MM or minutes"))?;
            if total == 0 {
                return Err(format!("wall-time '{s}' must be non-zero"));
            }
            Ok(Self(total))
        }
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl Serialize for WallTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WallTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
