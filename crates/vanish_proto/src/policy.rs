//! Per-message lifecycle policy chosen at send time.
//!
//! Persisted auto-delete modes use the short forms `none`, `view`, `1h`
//! and `3h`; `view-once` and arbitrary `<n>h` / `<n>m` durations also parse.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LifecyclePolicy {
    #[default]
    None,
    ViewOnce,
    /// Deleted once `created_at + duration` has passed, unless saved.
    Expiring(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unrecognised lifecycle policy: {0:?}")]
pub struct PolicyParseError(pub String);

impl LifecyclePolicy {
    pub fn hours(n: i64) -> Option<Self> {
        Duration::try_hours(n).filter(|d| *d > Duration::zero()).map(Self::Expiring)
    }

    pub fn minutes(n: i64) -> Option<Self> {
        Duration::try_minutes(n).filter(|d| *d > Duration::zero()).map(Self::Expiring)
    }

    pub fn is_view_once(&self) -> bool {
        matches!(self, LifecyclePolicy::ViewOnce)
    }

    pub fn expires_at(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            LifecyclePolicy::Expiring(d) => created_at.checked_add_signed(*d),
            _ => None,
        }
    }
}

impl fmt::Display for LifecyclePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePolicy::None => f.write_str("none"),
            LifecyclePolicy::ViewOnce => f.write_str("view"),
            LifecyclePolicy::Expiring(d) if d.num_seconds() % 3600 == 0 => {
                write!(f, "{}h", d.num_hours())
            }
            LifecyclePolicy::Expiring(d) if d.num_seconds() % 60 == 0 => {
                write!(f, "{}m", d.num_minutes())
            }
            LifecyclePolicy::Expiring(d) => write!(f, "{}s", d.num_seconds()),
        }
    }
}

impl FromStr for LifecyclePolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        let parsed = match norm.as_str() {
            "none" | "off" => Some(LifecyclePolicy::None),
            "view" | "view-once" | "view_once" => Some(LifecyclePolicy::ViewOnce),
            other => {
                let count = |suffix: char| other.strip_suffix(suffix)?.parse::<i64>().ok();
                count('h')
                    .and_then(Self::hours)
                    .or_else(|| count('m').and_then(Self::minutes))
                    .or_else(|| {
                        count('s')
                            .and_then(Duration::try_seconds)
                            .filter(|d| *d > Duration::zero())
                            .map(Self::Expiring)
                    })
            }
        };
        parsed.ok_or_else(|| PolicyParseError(s.to_string()))
    }
}

impl TryFrom<String> for LifecyclePolicy {
    type Error = PolicyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LifecyclePolicy> for String {
    fn from(p: LifecyclePolicy) -> Self {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_modes_parse() {
        assert_eq!("none".parse(), Ok(LifecyclePolicy::None));
        assert_eq!("view".parse(), Ok(LifecyclePolicy::ViewOnce));
        assert_eq!("View-Once".parse(), Ok(LifecyclePolicy::ViewOnce));
        assert_eq!("1h".parse(), Ok(LifecyclePolicy::Expiring(Duration::hours(1))));
        assert_eq!("3h".parse(), Ok(LifecyclePolicy::Expiring(Duration::hours(3))));
        assert_eq!("45m".parse(), Ok(LifecyclePolicy::Expiring(Duration::minutes(45))));
    }

    #[test]
    fn nonsense_and_non_positive_durations_are_rejected() {
        for bad in ["", "h", "0h", "-1h", "soon", "1d", "1.5h"] {
            assert!(bad.parse::<LifecyclePolicy>().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn display_roundtrips() {
        for p in [
            LifecyclePolicy::None,
            LifecyclePolicy::ViewOnce,
            LifecyclePolicy::Expiring(Duration::hours(3)),
            LifecyclePolicy::Expiring(Duration::minutes(90)),
            LifecyclePolicy::Expiring(Duration::seconds(42)),
        ] {
            assert_eq!(p.to_string().parse::<LifecyclePolicy>().unwrap(), p);
        }
        assert_eq!(LifecyclePolicy::Expiring(Duration::minutes(90)).to_string(), "90m");
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&LifecyclePolicy::Expiring(Duration::hours(1))).unwrap();
        assert_eq!(json, r#""1h""#);
        let back: LifecyclePolicy = serde_json::from_str(r#""view""#).unwrap();
        assert_eq!(back, LifecyclePolicy::ViewOnce);
        assert!(serde_json::from_str::<LifecyclePolicy>(r#""later""#).is_err());
    }

    #[test]
    fn only_expiring_policies_set_a_deadline() {
        let created = Utc::now();
        assert_eq!(LifecyclePolicy::None.expires_at(created), None);
        assert_eq!(LifecyclePolicy::ViewOnce.expires_at(created), None);
        assert_eq!(
            LifecyclePolicy::hours(1).unwrap().expires_at(created),
            Some(created + Duration::seconds(3600))
        );
    }
}
