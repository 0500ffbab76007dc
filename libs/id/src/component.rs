//! Component names derived from container image references.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::IdError;

/// Name of a resource-manager component.
///
/// Component names double as hostname prefixes on the cluster (instances are
/// named `{component}-{ordinal}`), so they must be lowercase DNS labels that
/// start with a letter. Whenever deriving a name from an image reference loses
/// information (characters replaced, case folded, or the result shortened to
/// [`ComponentName::MAX_LEN`]), the name is suffixed with a digest of the full
/// reference, so distinct images land on distinct components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentName(String);

impl ComponentName {
    /// Maximum length, leaving room for the `-{ordinal}` instance suffix
    /// inside a 63-byte DNS label.
    pub const MAX_LEN: usize = 48;

    const DIGEST_LEN: usize = 8;

    /// Validates an existing component name.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    /// Derives the component name for an image reference.
    ///
    /// `docker.io/openwhisk/action-nodejs-v20:1.2` becomes
    /// `docker-io-openwhisk-action-nodejs-v20-1-2-{digest}`; a reference that
    /// is already a valid name, such as `nodejs`, is used as is.
    pub fn from_image(image: &str) -> Result<Self, IdError> {
        let mut name = String::with_capacity(image.len());
        for c in image.chars().flat_map(char::to_lowercase) {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                name.push(c);
            } else if !name.is_empty() && !name.ends_with('-') {
                name.push('-');
            }
        }
        while name.ends_with('-') {
            name.pop();
        }

        if name.is_empty() {
            return Err(IdError::InvalidComponentName {
                name: image.to_string(),
                reason: "image reference has no alphanumeric characters",
            });
        }

        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert_str(0, "c-");
        }

        if name != image || name.len() > Self::MAX_LEN {
            let digest = hex::encode(Sha256::digest(image.as_bytes()));
            name.truncate(Self::MAX_LEN - Self::DIGEST_LEN - 1);
            while name.ends_with('-') {
                name.pop();
            }
            name.push('-');
            name.push_str(&digest[..Self::DIGEST_LEN]);
        }

        Self::new(name)
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> Result<(), IdError> {
    let invalid = |reason| {
        Err(IdError::InvalidComponentName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return Err(IdError::Empty);
    }
    if name.len() > ComponentName::MAX_LEN {
        return invalid("longer than 48 characters");
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return invalid("must start with a lowercase letter");
    }
    if name.ends_with('-') {
        return invalid("must not end with '-'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("only lowercase letters, digits and '-' are allowed");
    }
    Ok(())
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ComponentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ComponentName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ComponentName> for String {
    fn from(value: ComponentName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("nodejs", "nodejs")]
    #[case("action-python-3", "action-python-3")]
    #[case("openwhisk/action-nodejs-v20:latest", "openwhisk-action-nodejs-v20-latest-29d50790")]
    #[case("docker.io/openwhisk/python3action:1.0", "docker-io-openwhisk-python3action-1-0-3b7405c1")]
    #[case("Registry:5000/Team/App", "registry-5000-team-app-1680a7ac")]
    #[case("--weird__image--", "weird-image-678f7c86")]
    #[case("3rdparty/runtime:v1", "c-3rdparty-runtime-v1-1b257937")]
    fn test_from_image(#[case] image: &str, #[case] expected: &str) {
        assert_eq!(ComponentName::from_image(image).unwrap().as_str(), expected);
    }

    #[test]
    fn test_from_image_is_deterministic() {
        let a = ComponentName::from_image("openwhisk/action-java-v8:nightly").unwrap();
        let b = ComponentName::from_image("openwhisk/action-java-v8:nightly").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_long_images_keep_distinct_names() {
        let base = "registry.example.com/some/very/deeply/nested/organisation/runtime";
        let a = ComponentName::from_image(&format!("{base}:v1")).unwrap();
        let b = ComponentName::from_image(&format!("{base}:v2")).unwrap();

        assert!(a.as_str().len() <= ComponentName::MAX_LEN);
        assert!(b.as_str().len() <= ComponentName::MAX_LEN);
        assert_ne!(a, b);
    }

    #[rstest]
    #[case("openwhisk/a.b:1", "openwhisk/a-b:1")]
    #[case("openwhisk/a_b:1", "openwhisk/a-b:1")]
    #[case("Openwhisk/app:1", "openwhisk/app:1")]
    #[case("ow/app:v1", "ow-app-v1")]
    fn test_lossy_mappings_stay_distinct(#[case] a: &str, #[case] b: &str) {
        let a = ComponentName::from_image(a).unwrap();
        let b = ComponentName::from_image(b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(ComponentName::from_image("/:_").is_err());
    }

    #[rstest]
    #[case("")]
    #[case("-leading")]
    #[case("trailing-")]
    #[case("Upper")]
    #[case("under_score")]
    #[case("9lives")]
    fn test_invalid_names(#[case] name: &str) {
        assert!(ComponentName::new(name).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let ok: ComponentName = serde_json::from_str("\"python-3\"").unwrap();
        assert_eq!(ok.as_str(), "python-3");
        assert!(serde_json::from_str::<ComponentName>("\"Bad Name\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_derived_names_are_valid(image in "[ -~]{1,120}") {
            if let Ok(name) = ComponentName::from_image(&image) {
                prop_assert!(ComponentName::new(name.as_str()).is_ok());
            }
        }

        #[test]
        fn prop_distinct_images_get_distinct_names(
            a in "[a-zA-Z0-9./:_-]{1,40}",
            b in "[a-zA-Z0-9./:_-]{1,40}",
        ) {
            prop_assume!(a != b);
            if let (Ok(x), Ok(y)) = (ComponentName::from_image(&a), ComponentName::from_image(&b)) {
                prop_assert_ne!(x, y);
            }
        }
    }
}
