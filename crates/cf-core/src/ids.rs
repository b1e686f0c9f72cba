//! Typed ID wrappers providing compile-time safety for entity identifiers.
//!
//! Engine-owned entities use newtypes over `Uuid`. Step identifiers are
//! produced by the editing UI and are opaque strings, so [`StepId`] wraps a
//! `String` instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a newtype ID wrapper over `Uuid`.
///
/// The macro produces a struct with:
/// - `new()` to create a random v4 UUID
/// - `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`, `Serialize`, `Deserialize`
/// - `Display` and `FromStr` delegating to the inner UUID
/// - `From<Uuid>` and `Into<Uuid>` conversions
/// - `Default` that generates a new random ID
macro_rules! typed_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// Create a new random ID.
                #[must_use]
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                /// Return the inner UUID value.
                #[must_use]
                pub fn as_uuid(&self) -> &Uuid {
                    &self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl From<Uuid> for $name {
                fn from(uuid: Uuid) -> Self {
                    Self(uuid)
                }
            }

            impl From<$name> for Uuid {
                fn from(id: $name) -> Self {
                    id.0
                }
            }
        )+
    };
}

typed_id! {
    /// Unique identifier for a pipeline run.
    JobId,
    /// Unique identifier for a group of jobs sharing one source.
    BatchId,
    /// Unique identifier for a stored reference image.
    ImageId,
}

/// Stable identifier of a pipeline step, assigned by whoever authored the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn roundtrip_uuid() {
        let uuid = Uuid::new_v4();
        let id = BatchId::from(uuid);
        let back: Uuid = id.into();
        assert_eq!(uuid, back);
    }

    #[test]
    fn display_and_from_str() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_from_str() {
        assert!(ImageId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn step_id_is_transparent_string() {
        let id = StepId::from("step-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"step-1\"");
        assert_eq!(id.as_str(), "step-1");
    }
}
