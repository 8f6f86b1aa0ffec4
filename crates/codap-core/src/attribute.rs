//! # Attribute
//!
//! Column definitions owned by exactly one collection.

use crate::{AttributeId, AttributeType};
use serde::{Deserialize, Deserializer, Serialize};

/// A named column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: AttributeId,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub attr_type: AttributeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Set when the formula references an attribute that no longer exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula_error: Option<String>,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_true() -> bool {
    true
}

impl Attribute {
    /// Create an editable attribute of unspecified type.
    #[must_use]
    pub fn new(id: AttributeId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            title: name.clone(),
            name,
            attr_type: AttributeType::None,
            formula: None,
            formula_error: None,
            editable: true,
            hidden: false,
            precision: None,
            unit: String::new(),
            description: String::new(),
        }
    }

    /// Build an attribute from a creation spec.
    #[must_use]
    pub fn from_spec(id: AttributeId, spec: &AttributeSpec) -> Self {
        let mut attr = Self::new(id, spec.name.clone().unwrap_or_default());
        attr.apply_spec(spec);
        attr
    }

    /// Copy this definition under a new ID.
    ///
    /// Used when a child collection inherits its parent's attributes: the copy
    /// is independent, so later edits to the parent's definition do not
    /// reach it.
    #[must_use]
    pub fn copy_with_id(&self, id: AttributeId) -> Self {
        Self { id, ..self.clone() }
    }

    /// Apply the fields present in `spec`. Returns `true` if anything changed.
    ///
    /// `id` is never changed; `name` is applied as given (uniqueness is the
    /// collection's concern).
    pub fn apply_spec(&mut self, spec: &AttributeSpec) -> bool {
        let before = self.clone();
        if let Some(name) = &spec.name {
            if self.title == self.name && spec.title.is_none() {
                self.title = name.clone();
            }
            self.name = name.clone();
        }
        if let Some(title) = &spec.title {
            self.title = title.clone();
        }
        if let Some(t) = spec.attr_type {
            self.attr_type = t;
        }
        if let Some(formula) = &spec.formula {
            let formula = (!formula.is_empty()).then(|| formula.clone());
            // An error belongs to the formula it was raised for.
            if formula != self.formula {
                self.formula = formula;
                self.formula_error = None;
            }
        }
        if let Some(editable) = spec.editable {
            self.editable = editable;
        }
        if let Some(hidden) = spec.hidden {
            self.hidden = hidden;
        }
        if let Some(precision) = spec.precision {
            self.precision = precision;
        }
        if let Some(unit) = &spec.unit {
            self.unit = unit.clone();
        }
        if let Some(description) = &spec.description {
            self.description = description.clone();
        }
        *self != before
    }

    /// A spec that reproduces every field of this attribute.
    #[must_use]
    pub fn to_spec(&self) -> AttributeSpec {
        AttributeSpec {
            id: Some(self.id),
            name: Some(self.name.clone()),
            title: Some(self.title.clone()),
            attr_type: Some(self.attr_type),
            formula: Some(self.formula.clone().unwrap_or_default()),
            editable: Some(self.editable),
            hidden: Some(self.hidden),
            precision: Some(self.precision),
            unit: Some(self.unit.clone()),
            description: Some(self.description.clone()),
        }
    }

    /// Whether this attribute's formula mentions `name` as an identifier.
    #[must_use]
    pub fn formula_references(&self, name: &str) -> bool {
        self.formula
            .as_deref()
            .is_some_and(|formula| formula_mentions(formula, name))
    }
}

/// Identifier-boundary search: `a` matches in `a + 1` but not in `area`.
fn formula_mentions(formula: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    formula.match_indices(name).any(|(start, _)| {
        let before_ok = formula[..start].chars().next_back().is_none_or(|c| !is_ident(c));
        let after_ok = formula[start + name.len()..]
            .chars()
            .next()
            .is_none_or(|c| !is_ident(c));
        before_ok && after_ok
    })
}

// =============================================================================
// ATTRIBUTE SPEC
// =============================================================================

/// Partial attribute description used by create/update changes.
///
/// Every field is optional; absent fields are left untouched on update and
/// take their defaults on create.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<AttributeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub attr_type: Option<AttributeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    /// Absent leaves precision alone; `null` clears it.
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub precision: Option<Option<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field,
/// which `#[serde(default)]` turns into `None`.
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u8>::deserialize(deserializer).map(Some)
}

impl AttributeSpec {
    /// A spec carrying only a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Builder-style type setter.
    #[must_use]
    pub fn with_type(mut self, attr_type: AttributeType) -> Self {
        self.attr_type = Some(attr_type);
        self
    }

    /// Builder-style formula setter.
    #[must_use]
    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }
}

/// Reference to an attribute by ID or by name.
///
/// Lookups try the ID first, then fall back to the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeRef {
    Id(AttributeId),
    Name(String),
}

impl From<AttributeId> for AttributeRef {
    fn from(id: AttributeId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for AttributeRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
