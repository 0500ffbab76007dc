//! Image descriptors as handed over by the runtime manifest.

use std::fmt;
use std::str::FromStr;

use yarnpool_id::ComponentName;

use crate::error::FactoryError;

/// A `prefix/name:tag` image reference.
///
/// `prefix` is everything before the last `/` (a registry host and/or a
/// namespace). A `:` before the last `/` belongs to a registry port, not the
/// tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub prefix: Option<String>,
    pub name: String,
    pub tag: Option<String>,
}

impl ImageName {
    pub fn parse(image: &str) -> Result<Self, FactoryError> {
        let image = image.trim();
        let invalid = |why: &str| FactoryError::InvalidImage(format!("{image:?}: {why}"));

        if image.is_empty() {
            return Err(invalid("empty"));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (prefix, rest) = match image.rsplit_once('/') {
            Some((prefix, rest)) => (Some(prefix), rest),
            None => (None, image),
        };
        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (rest, None),
        };

        if prefix.is_some_and(str::is_empty) {
            return Err(invalid("empty prefix"));
        }
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if tag.is_some_and(|t| t.is_empty() || t.contains(':')) {
            return Err(invalid("malformed tag"));
        }

        Ok(Self {
            prefix: prefix.map(str::to_string),
            name: name.to_string(),
            tag: tag.map(str::to_string),
        })
    }

    /// Artifact id sent to the resource manager.
    ///
    /// Caller-provided images are used verbatim. Runtime images get the
    /// configured runtimes registry prepended, unless they already name it.
    pub fn resolve(&self, runtimes_registry: Option<&str>, use_provided_image: bool) -> String {
        let reference = self.to_string();
        match runtimes_registry.map(|r| r.trim_end_matches('/')) {
            Some(registry) if !use_provided_image && !reference.starts_with(registry) => {
                format!("{registry}/{reference}")
            }
            _ => reference,
        }
    }

    /// Component hosting containers of this image once resolved.
    pub fn component_name(
        &self,
        runtimes_registry: Option<&str>,
        use_provided_image: bool,
    ) -> Result<ComponentName, FactoryError> {
        let artifact = self.resolve(runtimes_registry, use_provided_image);
        ComponentName::from_image(&artifact).map_err(|e| FactoryError::InvalidImage(e.to_string()))
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, "{prefix}/")?;
        }
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageName {
    type Err = FactoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
