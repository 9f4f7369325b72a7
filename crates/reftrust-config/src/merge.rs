//! Layered merging of TOML trees with per-field provenance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLayer {
    /// Embedded `defaults.toml`.
    Defaults,
    /// The user config file.
    User,
    /// `{workspace}/.reftrust/config.toml`.
    Workspace,
    /// A `REFTRUST_*` environment variable.
    Environment,
}

/// Dotted field path to the layer that last set it.
pub type FieldSources = BTreeMap<String, ConfigLayer>;

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Record every leaf of `value` as coming from `layer`.
pub fn record_leaves(value: &toml::Value, prefix: &str, layer: ConfigLayer, sources: &mut FieldSources) {
    if let toml::Value::Table(table) = value {
        for (key, child) in table {
            record_leaves(child, &join(prefix, key), layer, sources);
        }
    } else {
        sources.insert(prefix.to_owned(), layer);
    }
}

/// Deep-merge `overlay` into `base`. Tables merge per key; scalars and
/// arrays replace.
pub fn deep_merge_tracking(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    layer: ConfigLayer,
    sources: &mut FieldSources,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = join(prefix, key);
                match base_table.get_mut(key) {
                    Some(base_val) if overlay_val.is_table() => {
                        deep_merge_tracking(base_val, overlay_val, &path, layer, sources);
                    },
                    Some(base_val) => {
                        *base_val = overlay_val.clone();
                        sources.insert(path, layer);
                    },
                    None => {
                        base_table.insert(key.clone(), overlay_val.clone());
                        record_leaves(overlay_val, &path, layer, sources);
                    },
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            sources.insert(prefix.to_owned(), layer);
        },
    }
}

/// Mode switches a workspace file may turn off but never on.
const RESTRICTED_FLAGS: [&str; 2] = ["developer", "eval"];

/// Undo any mode switch the workspace layer enabled over `baseline`.
pub fn enforce_workspace_restrictions(
    merged: &mut toml::Value,
    baseline: &toml::Value,
    sources: &mut FieldSources,
) {
    let Some(mode) = merged.get_mut("mode").and_then(toml::Value::as_table_mut) else {
        return;
    };
    for flag in RESTRICTED_FLAGS {
        let before = baseline
            .get("mode")
            .and_then(|m| m.get(flag))
            .and_then(toml::Value::as_bool)
            .unwrap_or(false);
        let after = mode.get(flag).and_then(toml::Value::as_bool).unwrap_or(false);
        if after && !before {
            warn!(flag, "Workspace config cannot enable a restricted mode; ignoring");
            mode.insert(flag.to_owned(), toml::Value::Boolean(false));
            sources.remove(&format!("mode.{flag}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_merge_tracks_layers() {
        let mut base = parse("[logging]\nlevel = \"info\"\nformat = \"pretty\"\n");
        let mut sources = FieldSources::new();
        record_leaves(&base, "", ConfigLayer::Defaults, &mut sources);

        let overlay = parse("[logging]\nlevel = \"debug\"\n[verify]\nsync_remote = true\n");
        deep_merge_tracking(&mut base, &overlay, "", ConfigLayer::User, &mut sources);

        assert_eq!(base["logging"]["level"].as_str(), Some("debug"));
        assert_eq!(base["logging"]["format"].as_str(), Some("pretty"));
        assert_eq!(sources.get("logging.level"), Some(&ConfigLayer::User));
        assert_eq!(sources.get("logging.format"), Some(&ConfigLayer::Defaults));
        assert_eq!(sources.get("verify.sync_remote"), Some(&ConfigLayer::User));
    }

    #[test]
    fn test_workspace_cannot_enable_modes() {
        let baseline = parse("[mode]\ndeveloper = true\neval = false\n");
        let mut merged = parse("[mode]\ndeveloper = true\neval = true\n");
        let mut sources = FieldSources::new();
        enforce_workspace_restrictions(&mut merged, &baseline, &mut sources);
        assert_eq!(merged["mode"]["developer"].as_bool(), Some(true));
        assert_eq!(merged["mode"]["eval"].as_bool(), Some(false));
    }
}
