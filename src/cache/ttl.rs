//! Request-class TTL policy.

use crate::{Error, ErrorContext, Result};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Built-in table: conversational classes live about an hour, reference plans a
/// day, progress/state snapshots half an hour.
const BUILTIN: &[(&str, u64)] = &[
    ("chat", HOUR),
    ("recommendation", HOUR),
    ("meal_plan", 24 * HOUR),
    ("workout_plan", 24 * HOUR),
    ("nutrition_analysis", 24 * HOUR),
    ("progress_analysis", 30 * MINUTE),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlResolution {
    pub ttl: Duration,
    /// True when the class had no mapping and the default was applied.
    pub defaulted: bool,
}

/// Maps request classes to expiry durations. Never resolves to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    classes: HashMap<String, Duration>,
    default_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            classes: BUILTIN
                .iter()
                .map(|(class, secs)| (class.to_string(), Duration::from_secs(*secs)))
                .collect(),
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl TtlPolicy {
    /// The built-in table.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty table: every class resolves to `default_ttl`.
    pub fn empty(default_ttl: Duration) -> Result<Self> {
        check_non_zero("default_ttl", default_ttl)?;
        Ok(Self {
            classes: HashMap::new(),
            default_ttl,
        })
    }

    pub fn from_map(classes: HashMap<String, Duration>, default_ttl: Duration) -> Result<Self> {
        check_non_zero("default_ttl", default_ttl)?;
        for (class, ttl) in &classes {
            check_non_zero(&format!("ttl.{}", class), *ttl)?;
        }
        Ok(Self {
            classes,
            default_ttl,
        })
    }

    pub fn with_class(mut self, class: impl Into<String>, ttl: Duration) -> Result<Self> {
        let class = class.into();
        check_non_zero(&format!("ttl.{}", class), ttl)?;
        self.classes.insert(class, ttl);
        Ok(self)
    }

    pub fn with_default(mut self, ttl: Duration) -> Result<Self> {
        check_non_zero("default_ttl", ttl)?;
        self.default_ttl = ttl;
        Ok(self)
    }

    pub fn resolve(&self, request_class: &str) -> TtlResolution {
        match self.classes.get(request_class) {
            Some(ttl) => TtlResolution {
                ttl: *ttl,
                defaulted: false,
            },
            None => TtlResolution {
                ttl: self.default_ttl,
                defaulted: true,
            },
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn classes(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.classes.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn check_non_zero(field: &str, ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::configuration_with_context(
            "TTL must be greater than zero",
            ErrorContext::new()
                .with_field_path(field)
                .with_source("ttl_policy"),
        ));
    }
    Ok(())
}
