//! ---
//! keel_section: "04-configuration"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Dotted-path lookups over configuration documents."
//! keel_version: "v0.1.0"
//! keel_owner: "tbd"
//! ---
use serde::de::DeserializeOwned;
use tracing::warn;

/// Read-only view over a TOML document addressed by dotted paths (`health.retries`).
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigView {
    root: toml::Value,
}

impl Default for ConfigView {
    fn default() -> Self {
        Self::from_table(toml::Table::new())
    }
}

impl ConfigView {
    pub fn new(root: toml::Value) -> Self {
        Self { root }
    }

    pub fn from_table(table: toml::Table) -> Self {
        Self::new(toml::Value::Table(table))
    }

    /// Raw value at `path`, walking nested tables segment by segment.
    pub fn get(&self, path: &str) -> Option<&toml::Value> {
        if path.is_empty() {
            return Some(&self.root);
        }
        path.split('.')
            .try_fold(&self.root, |node, segment| node.as_table()?.get(segment))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Typed value at `path`; `None` when missing or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let value = self.get(path)?.clone();
        match T::deserialize(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(path, error = %err, "configuration value has unexpected type");
                None
            }
        }
    }

    /// Typed value at `path`, falling back to `default`.
    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get_as(path).unwrap_or(default)
    }

    /// Sub-view rooted at `path`, empty when the path does not name a table.
    pub fn section(&self, path: &str) -> ConfigView {
        match self.get(path) {
            Some(value @ toml::Value::Table(_)) => ConfigView::new(value.clone()),
            _ => ConfigView::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.as_table().map(|t| t.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ConfigView {
        let table: toml::Table = toml::from_str(
            r#"
            pool_size = 8
            dsn = "postgres://localhost/app"

            [tls]
            enabled = true
            ciphers = ["a", "b"]
            "#,
        )
        .unwrap();
        ConfigView::from_table(table)
    }

    #[test]
    fn resolves_nested_paths() {
        let view = view();
        assert_eq!(view.get_or("pool_size", 1u32), 8);
        assert!(view.get_or("tls.enabled", false));
        assert_eq!(
            view.get_as::<Vec<String>>("tls.ciphers"),
            Some(vec!["a".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn falls_back_on_missing_or_mistyped_values() {
        let view = view();
        assert_eq!(view.get_or("tls.port", 443u16), 443);
        assert_eq!(view.get_or("dsn", 0u32), 0);
        assert!(view.get("pool_size.inner").is_none());
    }

    #[test]
    fn sections_narrow_the_root() {
        let tls = view().section("tls");
        assert!(tls.get_or("enabled", false));
        assert!(view().section("dsn").is_empty());
    }
}
