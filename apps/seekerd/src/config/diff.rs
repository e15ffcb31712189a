//! Field-level comparison of option snapshots.
//!
//! Two snapshots are flattened into leaf paths and compared; each difference
//! carries the change class looked up from the registry. An empty diff must
//! never fire change callbacks, which guards subscribers against spurious
//! duplicate events.

use serde_json::Value;

use super::registry::{descriptor_for, ChangeClass};
use super::Options;

/// One changed option leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionChange {
    /// Dotted path, with `[n]` segments for array elements.
    pub path: String,
    pub left: Value,
    pub right: Value,
    pub change_class: ChangeClass,
    secret: bool,
}

impl OptionChange {
    /// Render the change for logs, with secret values redacted.
    pub fn describe(&self) -> String {
        if self.secret {
            format!("{}: [REDACTED] -> [REDACTED]", self.path)
        } else {
            format!("{}: {} -> {}", self.path, self.left, self.right)
        }
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }
}

/// Compute the leaf-level differences between two snapshots.
pub fn diff(previous: &Options, next: &Options) -> Vec<OptionChange> {
    // Options is fully serde-serializable, so the tree walk happens on the
    // JSON representation rather than on the typed structs.
    let left = serde_json::to_value(previous).unwrap_or(Value::Null);
    let right = serde_json::to_value(next).unwrap_or(Value::Null);

    let mut changes = Vec::new();
    walk(String::new(), &left, &right, &mut changes);
    changes
}

fn walk(path: String, left: &Value, right: &Value, out: &mut Vec<OptionChange>) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                walk(
                    child,
                    l.get(key).unwrap_or(&Value::Null),
                    r.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (Value::Array(l), Value::Array(r)) => {
            let len = l.len().max(r.len());
            for i in 0..len {
                walk(
                    format!("{}[{}]", path, i),
                    l.get(i).unwrap_or(&Value::Null),
                    r.get(i).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (l, r) => {
            if l != r {
                let (change_class, secret) = descriptor_for(&path)
                    .map(|d| (d.change_class, d.secret))
                    .unwrap_or((ChangeClass::None, false));
                out.push(OptionChange {
                    path,
                    left: l.clone(),
                    right: r.clone(),
                    change_class,
                    secret,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_snapshots_yield_empty_diff() {
        let options = Options::default();
        assert!(diff(&options, &options.clone()).is_empty());
    }

    #[test]
    fn test_diff_is_idempotent() {
        let previous = Options::default();
        let mut next = previous.clone();
        next.soulseek.listen_port = 50301;

        assert_eq!(diff(&previous, &next).len(), 1);
        // Emitting the same snapshot twice yields nothing the second time.
        assert!(diff(&next, &next.clone()).is_empty());
    }

    #[test]
    fn test_listen_port_classed_reconnect() {
        let previous = Options::default();
        let mut next = previous.clone();
        next.soulseek.listen_port = 50301;

        let changes = diff(&previous, &next);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "soulseek.listen_port");
        assert_eq!(changes[0].change_class, ChangeClass::RequiresReconnect);
    }

    #[test]
    fn test_content_path_classed_restart() {
        let previous = Options::default();
        let mut next = previous.clone();
        next.web.content_path = "/srv/www".into();

        let changes = diff(&previous, &next);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_class, ChangeClass::RequiresRestart);
    }

    #[test]
    fn test_secret_change_redacted_in_description() {
        let previous = Options::default();
        let mut next = previous.clone();
        next.soulseek.password = Some("hunter2".to_string());

        let changes = diff(&previous, &next);
        let change = changes
            .iter()
            .find(|c| c.path == "soulseek.password")
            .unwrap();
        assert!(change.is_secret());
        assert!(!change.describe().contains("hunter2"));
    }

    #[test]
    fn test_list_growth_produces_indexed_paths() {
        let previous = Options::default();
        let mut next = previous.clone();
        next.shares.directories = vec!["/m/a".into()];

        let changes = diff(&previous, &next);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "shares.directories[0]");
    }
}
