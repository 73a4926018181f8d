//! Layer-index name patterns
//!
//! A pattern is a literal name with at most one `{i}` placeholder standing
//! for a decimal layer index, e.g. `model.layers.{i}.mlp.up_proj.weight` or
//! `decoder/layers_{i}/mlp/wi_1/kernel`. Expansion over a layer count and
//! index capture on match are the only operations; hooks never see patterns.

use std::fmt;

use crate::error::{MappingError, Result};

/// Placeholder marker for the layer index
pub const LAYER_PLACEHOLDER: &str = "{i}";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamePattern {
    source: String,
    /// Literal text before / after the placeholder (whole name when absent)
    prefix: String,
    suffix: Option<String>,
}

impl NamePattern {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = source.split(LAYER_PLACEHOLDER);
        let prefix = parts.next().unwrap_or_default().to_string();
        let suffix = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(MappingError::InvalidPattern(format!(
                "'{}' has more than one {} placeholder",
                source, LAYER_PLACEHOLDER
            )));
        }
        if source.is_empty() {
            return Err(MappingError::InvalidPattern("empty pattern".to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            prefix,
            suffix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the pattern carries a layer placeholder
    pub fn is_layered(&self) -> bool {
        self.suffix.is_some()
    }

    /// Concrete name for one layer (the pattern itself when not layered)
    pub fn substitute(&self, layer: usize) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}{}{}", self.prefix, layer, suffix),
            None => self.prefix.clone(),
        }
    }

    /// Concrete names for layers `0..layer_count`, in layer order
    pub fn expand(&self, layer_count: usize) -> Vec<String> {
        if self.is_layered() {
            (0..layer_count).map(|i| self.substitute(i)).collect()
        } else {
            vec![self.prefix.clone()]
        }
    }

    /// Match a concrete name
    ///
    /// Returns `None` when the name does not match, `Some(None)` for a match
    /// of an unlayered pattern and `Some(Some(i))` with the captured index.
    pub fn captures(&self, name: &str) -> Option<Option<usize>> {
        let Some(suffix) = &self.suffix else {
            return (name == self.prefix).then_some(None);
        };
        let middle = name.strip_prefix(self.prefix.as_str())?.strip_suffix(suffix.as_str())?;
        let canonical = !middle.is_empty()
            && middle.bytes().all(|b| b.is_ascii_digit())
            && (middle == "0" || !middle.starts_with('0'));
        if !canonical {
            return None;
        }
        middle.parse().ok().map(Some)
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
