//! Label maps and dynamic (command-produced) labels.

use std::collections::BTreeMap;
use std::time::Duration;

use postcard::{from_bytes, to_allocvec};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// A map from label key to an ordered list of values.
///
/// This is the multi-valued form used by role matchers; resource metadata
/// carries the single-valued `BTreeMap<String, String>` form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(pub BTreeMap<String, Vec<String>>);

impl Labels {
    /// An empty label map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label with its values, replacing any previous entry.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.0.insert(key.into(), values);
        self
    }

    /// The values recorded under `key`.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    /// True if no labels are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the canonical tagged binary form.
    pub fn to_postcard(&self) -> Vec<u8> {
        to_allocvec(self).expect("Labels::to_postcard")
    }

    /// Deserialize from the canonical tagged binary form.
    pub fn from_postcard(bytes: &[u8]) -> Result<Self> {
        from_bytes(bytes).map_err(|e| Error::bad_parameter(format!("malformed labels: {e}")))
    }
}

impl<const N: usize> From<[(&str, &[&str]); N]> for Labels {
    fn from(entries: [(&str, &[&str]); N]) -> Self {
        let mut labels = Labels::new();
        for (k, vs) in entries {
            labels.insert(k, vs.iter().map(|v| v.to_string()).collect());
        }
        labels
    }
}

pub(crate) mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// A label whose value is produced by periodically executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLabel {
    /// How often the command runs.
    #[serde(with = "duration_secs")]
    pub period: Duration,
    /// The command and its arguments.
    pub command: Vec<String>,
    /// The last computed value; command failures are recorded here too.
    #[serde(default)]
    pub result: String,
}

impl CommandLabel {
    /// Validate the label definition.
    pub fn check(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::bad_parameter("dynamic label command is empty"));
        }
        if self.period.is_zero() {
            return Err(Error::bad_parameter("dynamic label period must be positive"));
        }
        Ok(())
    }
}

/// Merge static and dynamic labels into one single-valued map.
///
/// Dynamic labels win with their last-computed `result`.
pub fn combine_labels(
    static_labels: &BTreeMap<String, String>,
    dynamic_labels: &BTreeMap<String, CommandLabel>,
) -> BTreeMap<String, String> {
    let mut combined = static_labels.clone();
    for (key, label) in dynamic_labels {
        combined.insert(key.clone(), label.result.clone());
    }
    combined
}
