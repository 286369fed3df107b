//! Query templates with `{variable}` placeholders and their expansion.

use crate::error::CollectError;
use crate::models::{VariableBinding, Variables};
use regex::Regex;
use serde::{Deserialize, Serialize};

const PLACEHOLDER_PATTERN: &str = r"\{([^{}]+)\}";

/// Lower-cases a variable name and replaces spaces with underscores.
pub fn normalize_variable_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Normalizes every key of a caller-supplied variable map.
pub fn normalize_variables<I, K>(variables: I) -> Variables
where
    I: IntoIterator<Item = (K, Vec<String>)>,
    K: AsRef<str>,
{
    let mut normalized = Variables::new();
    for (name, values) in variables {
        normalized
            .entry(normalize_variable_name(name.as_ref()))
            .or_default()
            .extend(values);
    }
    normalized
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryTemplate {
    text: String,
    variables: Vec<String>,
}

impl QueryTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self, CollectError> {
        let text = text.into();
        let pattern = Regex::new(PLACEHOLDER_PATTERN)?;

        let mut variables = Vec::new();
        for capture in pattern.captures_iter(&text) {
            let name = normalize_variable_name(&capture[1]);
            if !variables.contains(&name) {
                variables.push(name);
            }
        }

        Ok(Self { text, variables })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Normalized placeholder names, in order of first appearance.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Fills every placeholder from `binding`.
    ///
    /// Fails if any placeholder has no value, so a returned query never
    /// contains an unfilled placeholder.
    pub fn instantiate(&self, binding: &VariableBinding) -> Result<String, CollectError> {
        if let Some(missing) = self
            .variables
            .iter()
            .find(|name| binding.get(name).is_none())
        {
            return Err(CollectError::InvalidArgument(format!(
                "template '{}' has no value for variable '{missing}'",
                self.text
            )));
        }

        let pattern = Regex::new(PLACEHOLDER_PATTERN)?;
        let query = pattern.replace_all(&self.text, |capture: &regex::Captures<'_>| {
            binding.get(&capture[1]).unwrap_or_default().to_string()
        });

        Ok(query.trim().to_string())
    }
}

/// A query produced from one template and one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedQuery {
    pub template: String,
    pub query: String,
    pub binding: VariableBinding,
}

/// Instantiates every template against every combination of the values of
/// the variables it uses.
///
/// Templates without placeholders pass through with an empty binding. A
/// template using a variable with no values is dropped with a warning; it is
/// an error only when no query is left.
pub fn expand_templates(
    templates: &[QueryTemplate],
    variables: &Variables,
) -> Result<Vec<ExpandedQuery>, CollectError> {
    let variables = normalize_variables(variables.clone());
    let mut expanded = Vec::new();
    let mut dropped = Vec::new();

    'templates: for template in templates {
        let mut bindings = vec![VariableBinding::new()];

        for name in template.variables() {
            let Some(values) = variables.get(name).filter(|values| !values.is_empty()) else {
                tracing::warn!(
                    template = template.text(),
                    variable = name.as_str(),
                    "dropping template with an unknown variable"
                );
                dropped.push(format!("'{}' uses '{name}'", template.text()));
                continue 'templates;
            };

            bindings = bindings
                .into_iter()
                .flat_map(|binding| {
                    values
                        .iter()
                        .map(move |value| binding.clone().with(name.as_str(), value.as_str()))
                })
                .collect();
        }

        for binding in bindings {
            expanded.push(ExpandedQuery {
                template: template.text().to_string(),
                query: template.instantiate(&binding)?,
                binding,
            });
        }
    }

    if expanded.is_empty() && !dropped.is_empty() {
        return Err(CollectError::InvalidArgument(format!(
            "no query left: every template uses a variable without values ({})",
            dropped.join(", ")
        )));
    }

    tracing::debug!(
        templates = templates.len(),
        queries = expanded.len(),
        "expanded query templates"
    );

    Ok(expanded)
}
