// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Templates for SQL statements and email bodies
//!
//! Each template declares the substitution keys it recognizes. Rendering
//! with a key outside that set is a configuration error rather than being
//! silently ignored, and a key the body uses but the caller did not supply
//! fails in Tera.

use crate::{Error, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tera::{Context, Tera};

/// Values to substitute into a template, by key.
pub type TemplateVars = BTreeMap<String, Value>;

/// Build [`TemplateVars`] from string pairs.
pub fn vars<K, V, I>(pairs: I) -> TemplateVars
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    body: String,
    keys: BTreeSet<String>,
}

impl Template {
    /// A template that accepts no substitution keys.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            keys: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Load a template body from a file; the template is named after the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, body))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    #[must_use]
    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    /// Check that every supplied key is recognized.
    pub fn validate(&self, vars: &TemplateVars) -> Result<()> {
        let unknown: Vec<&str> = vars
            .keys()
            .filter(|k| !self.keys.contains(*k))
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "template '{}' does not accept key(s): {}",
                self.name,
                unknown.join(", ")
            )))
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> Result<String> {
        self.validate(vars)?;

        let mut context = Context::new();
        for (key, value) in vars {
            context.insert(key.as_str(), value);
        }

        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_template(&self.name, &self.body)
            .map_err(|e| Error::Configuration(format!("template '{}': {e}", self.name)))?;
        tera.render(&self.name, &context)
            .map_err(|e| Error::Configuration(format!("template '{}': {e}", self.name)))
    }
}

/// A folder of template files, e.g. SQL scripts.
#[derive(Debug, Clone)]
pub struct TemplateFolder {
    root: PathBuf,
}

impl TemplateFolder {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Load `name` from the folder, accepting `keys`.
    pub fn load<I, S>(&self, name: &str, keys: I) -> Result<Template>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Template::from_file(self.root.join(name))?.with_keys(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_known_keys() {
        let t = Template::new("q", "SELECT * FROM t WHERE d = '{{ day }}' LIMIT {{ n }}")
            .with_keys(["day", "n"]);
        let out = t
            .render(&vars([("day", Value::from("2024-01-01")), ("n", Value::from(5))]))
            .expect("render");
        assert_eq!(out, "SELECT * FROM t WHERE d = '2024-01-01' LIMIT 5");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let t = Template::new("q", "SELECT 1").with_keys(["day"]);
        let err = t
            .render(&vars([("month", "5")]))
            .expect_err("unknown key");
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert!(err.to_string().contains("month"));
    }

    #[test]
    fn test_missing_value_rejected() {
        let t = Template::new("q", "SELECT {{ col }}").with_keys(["col"]);
        let err = t.render(&TemplateVars::new()).expect_err("missing");
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_no_html_escaping() {
        let t = Template::new("mail", "<p>{{ who }}</p>").with_keys(["who"]);
        let out = t.render(&vars([("who", "A & B <x>")])).expect("render");
        assert_eq!(out, "<p>A & B <x></p>");
    }

    #[test]
    fn test_folder_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("daily.sql"), "DELETE FROM t WHERE d < '{{ cutoff }}'")
            .expect("write");

        let t = TemplateFolder::new(dir.path())
            .load("daily.sql", ["cutoff"])
            .expect("load");
        assert_eq!(t.name(), "daily.sql");
        assert_eq!(
            t.render(&vars([("cutoff", "2024-01-01")])).expect("render"),
            "DELETE FROM t WHERE d < '2024-01-01'"
        );
    }
}
