//! Container property store.
//!
//! A `Spec` maps string property names to string values. Each recognized
//! property is either *dynamic* (settable while running) or *static*
//! (settable only when stopped) and has a default. Internal slots — the
//! pieces of state the supervisor persists but never exposes through the
//! property interface — live under `_`-prefixed keys in the same record.

use std::collections::BTreeMap;

use stockade_common::constants::INTERNAL_PREFIX;
use stockade_common::error::{Error, Result};

use crate::store::Record;

/// Static description of one user-visible property.
#[derive(Debug, Clone, Copy)]
pub struct PropertyDef {
    /// Property name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Whether the property may be changed while the container runs.
    pub dynamic: bool,
    /// Value reported when the property was never set.
    pub default: &'static str,
}

/// Every property the supervisor recognizes.
pub const PROPERTIES: &[PropertyDef] = &[
    PropertyDef {
        name: "command",
        description: "command executed as the container's root process",
        dynamic: false,
        default: "",
    },
    PropertyDef {
        name: "cwd",
        description: "working directory of the root process",
        dynamic: false,
        default: "/",
    },
    PropertyDef {
        name: "root",
        description: "new root directory (chroot) for the root process",
        dynamic: false,
        default: "",
    },
    PropertyDef {
        name: "user",
        description: "user the root process runs as",
        dynamic: false,
        default: "",
    },
    PropertyDef {
        name: "group",
        description: "group the root process runs as",
        dynamic: false,
        default: "",
    },
    PropertyDef {
        name: "env",
        description: "semicolon-separated KEY=VALUE environment entries",
        dynamic: false,
        default: "",
    },
    PropertyDef {
        name: "memory_limit",
        description: "hard memory limit in bytes, -1 for unlimited",
        dynamic: false,
        default: "-1",
    },
    PropertyDef {
        name: "memory_guarantee",
        description: "soft memory guarantee in bytes",
        dynamic: false,
        default: "0",
    },
];

fn lookup(name: &str) -> Option<&'static PropertyDef> {
    PROPERTIES.iter().find(|p| p.name == name)
}

/// Property bag of one container.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    values: BTreeMap<String, String>,
    internal: BTreeMap<String, String>,
}

impl Spec {
    /// Creates an empty spec; every property reads as its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a recognized property, falling back to its
    /// default when unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProperty`] for unknown names.
    pub fn get(&self, name: &str) -> Result<String> {
        let def = lookup(name)
            .ok_or_else(|| Error::InvalidProperty(format!("unknown property {name}")))?;
        Ok(self
            .values
            .get(name)
            .cloned()
            .unwrap_or_else(|| def.default.to_string()))
    }

    /// Sets a recognized property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProperty`] for unknown names (internal
    /// slots included — they are not settable through this interface).
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if lookup(name).is_none() {
            return Err(Error::InvalidProperty(format!("unknown property {name}")));
        }
        let _ = self.values.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Whether a recognized property may change while the container runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProperty`] for unknown names.
    pub fn is_dynamic(&self, name: &str) -> Result<bool> {
        lookup(name)
            .map(|d| d.dynamic)
            .ok_or_else(|| Error::InvalidProperty(format!("unknown property {name}")))
    }

    /// Reads an internal slot.
    #[must_use]
    pub fn get_internal(&self, key: &str) -> Option<&str> {
        self.internal.get(key).map(String::as_str)
    }

    /// Writes an internal slot. The key must carry the internal prefix.
    pub fn set_internal(&mut self, key: &str, value: impl Into<String>) {
        debug_assert!(key.starts_with(INTERNAL_PREFIX));
        let _ = self.internal.insert(key.to_string(), value.into());
    }

    /// Drops an internal slot.
    pub fn clear_internal(&mut self, key: &str) {
        let _ = self.internal.remove(key);
    }

    /// Serializes the spec into a persistence record: user-visible
    /// properties by name, internal slots under their prefixed keys.
    #[must_use]
    pub fn to_record(&self) -> Record {
        let mut record: Record = self.values.clone();
        record.extend(self.internal.clone());
        record
    }

    /// Rebuilds a spec from a persistence record. Unrecognized
    /// non-internal keys are dropped with a warning; a record written by
    /// a newer daemon must not poison restore.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        let mut spec = Self::new();
        for (key, value) in record {
            if key.starts_with(INTERNAL_PREFIX) {
                let _ = spec.internal.insert(key.clone(), value.clone());
            } else if lookup(key).is_some() {
                let _ = spec.values.insert(key.clone(), value.clone());
            } else {
                tracing::warn!(key, "dropping unrecognized property from record");
            }
        }
        spec
    }
}

/// Splits a semicolon-separated `KEY=VALUE` environment property.
///
/// # Errors
///
/// Returns [`Error::InvalidValue`] for entries without `=`.
pub fn parse_env(env: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in env.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((key, value)) = entry.split_once('=') else {
            return Err(Error::InvalidValue(format!(
                "malformed environment entry {entry:?}"
            )));
        };
        out.push((key.to_string(), value.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockade_common::constants::ROOT_PID_KEY;

    #[test]
    fn unset_property_reads_default() {
        let spec = Spec::new();
        assert_eq!(spec.get("cwd").expect("cwd"), "/");
        assert_eq!(spec.get("memory_limit").expect("limit"), "-1");
        assert_eq!(spec.get("command").expect("command"), "");
    }

    #[test]
    fn set_then_get_roundtrip() {
        let mut spec = Spec::new();
        spec.set("command", "/bin/sleep 60").expect("set");
        assert_eq!(spec.get("command").expect("get"), "/bin/sleep 60");
    }

    #[test]
    fn unknown_property_is_rejected() {
        let mut spec = Spec::new();
        assert!(spec.get("no_such_prop").is_err());
        assert!(spec.set("no_such_prop", "x").is_err());
        assert!(spec.is_dynamic("no_such_prop").is_err());
    }

    #[test]
    fn internal_slots_are_not_settable_as_properties() {
        let mut spec = Spec::new();
        assert!(spec.set(ROOT_PID_KEY, "1234").is_err());
    }

    #[test]
    fn record_roundtrip_keeps_properties_and_internals() {
        let mut spec = Spec::new();
        spec.set("command", "/bin/true").expect("set");
        spec.set("memory_limit", "4194304").expect("set");
        spec.set_internal(ROOT_PID_KEY, "4321");

        let record = spec.to_record();
        assert_eq!(record.get("command").map(String::as_str), Some("/bin/true"));
        assert_eq!(record.get(ROOT_PID_KEY).map(String::as_str), Some("4321"));

        let restored = Spec::from_record(&record);
        assert_eq!(restored.get("command").expect("command"), "/bin/true");
        assert_eq!(restored.get_internal(ROOT_PID_KEY), Some("4321"));
    }

    #[test]
    fn from_record_drops_unknown_keys() {
        let mut record = Record::new();
        let _ = record.insert("bogus".into(), "x".into());
        let _ = record.insert("command".into(), "/bin/true".into());
        let spec = Spec::from_record(&record);
        assert_eq!(spec.get("command").expect("command"), "/bin/true");
        assert!(!spec.to_record().contains_key("bogus"));
    }

    #[test]
    fn parse_env_splits_on_semicolons() {
        let env = parse_env("A=1;B=two;C=with=equals").expect("env");
        assert_eq!(
            env,
            vec![
                ("A".into(), "1".into()),
                ("B".into(), "two".into()),
                ("C".into(), "with=equals".into()),
            ]
        );
    }

    #[test]
    fn parse_env_skips_empty_entries_and_rejects_malformed() {
        assert!(parse_env("").expect("empty").is_empty());
        assert!(parse_env("A=1;;B=2").expect("blank entry").len() == 2);
        assert!(parse_env("NOEQUALS").is_err());
    }
}
