//! Placeholder templates and deterministic rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::warn;

use crate::error::{Error, Result};

/// Regex pattern for `{{ name }}` placeholders
static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("Invalid regex pattern")
});

/// Variable values available to templates.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Variables(BTreeMap<String, String>);

impl Variables {
    /// Creates an empty set of variables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a variable, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Sets a variable and returns `self`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Returns the value of a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns variable names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<BTreeMap<String, String>> for Variables {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Output of rendering one template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rendered {
    /// Rendered bytes.
    pub bytes: Vec<u8>,

    /// Supplied variables the template never references.
    pub unused: Vec<String>,
}

/// Template text and the placeholders it requires.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigTemplate {
    name: String,
    placeholders: BTreeSet<String>,
    text: String,
}

impl ConfigTemplate {
    /// Parses a template.
    #[must_use]
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let placeholders = PLACEHOLDER_REGEX
            .captures_iter(&text)
            .map(|caps| caps[1].to_string())
            .collect();

        Self {
            name: name.into(),
            placeholders,
            text,
        }
    }

    /// Returns the template identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the variables this template requires.
    #[must_use]
    pub const fn placeholders(&self) -> &BTreeSet<String> {
        &self.placeholders
    }

    /// Renders the template.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingVariables` if a placeholder has no value.
    pub fn render(&self, variables: &Variables) -> Result<Rendered> {
        let missing: Vec<String> = self
            .placeholders
            .iter()
            .filter(|name| variables.get(name).is_none())
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(Error::MissingVariables {
                template: self.name.clone(),
                variables: missing,
            });
        }

        let output = PLACEHOLDER_REGEX.replace_all(&self.text, |caps: &Captures<'_>| {
            variables.get(&caps[1]).unwrap_or_default().to_string()
        });

        let unused = variables
            .names()
            .filter(|name| !self.placeholders.contains(*name))
            .map(str::to_string)
            .collect();

        Ok(Rendered {
            bytes: output.into_owned().into_bytes(),
            unused,
        })
    }
}

/// Output of rendering a `TemplateSet`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RenderedSet {
    outputs: BTreeMap<String, Vec<u8>>,

    /// Supplied variables no template in the set references.
    pub unused: Vec<String>,
}

impl RenderedSet {
    /// Returns the rendered bytes of a template.
    #[must_use]
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.outputs.get(name).map(Vec::as_slice)
    }

    /// Returns the rendered text of a template.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.bytes(name).and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Every template of a stack, rendered together against one set of variables.
#[derive(Clone, Debug, Default)]
pub struct TemplateSet {
    templates: BTreeMap<String, ConfigTemplate>,
}

impl TemplateSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template under its name, replacing any previous one.
    pub fn add(&mut self, template: ConfigTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Parses and adds a template.
    pub fn add_text(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.add(ConfigTemplate::new(name, text));
    }

    /// Returns every variable referenced by any template.
    #[must_use]
    pub fn placeholders(&self) -> BTreeSet<String> {
        self.templates
            .values()
            .flat_map(|t| t.placeholders.iter().cloned())
            .collect()
    }

    /// Renders every template.
    ///
    /// Variables named in `builtins` are never reported as unused.
    ///
    /// # Errors
    ///
    /// Returns the first template's `Error::MissingVariables`, in name order.
    pub fn render_all(&self, variables: &Variables, builtins: &[&str]) -> Result<RenderedSet> {
        let mut outputs = BTreeMap::new();

        for (name, template) in &self.templates {
            let rendered = template.render(variables)?;
            outputs.insert(name.clone(), rendered.bytes);
        }

        let referenced = self.placeholders();
        let unused: Vec<String> = variables
            .names()
            .filter(|name| !referenced.contains(*name) && !builtins.contains(name))
            .map(str::to_string)
            .collect();

        if !unused.is_empty() {
            warn!(
                "variables not referenced by any template: {}",
                unused.join(", ")
            );
        }

        Ok(RenderedSet { outputs, unused })
    }
}
