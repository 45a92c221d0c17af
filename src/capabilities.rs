//! Server capability descriptor and translation options.

use std::{fmt, str::FromStr};

use crate::error::TranslationError;

/// A server version, compared by major then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        ServerVersion { major, minor }
    }
}

impl Default for ServerVersion {
    fn default() -> Self {
        ServerVersion::new(7, 0)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ServerVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let parse = |part: Option<&str>| -> Result<u32, String> {
            match part {
                Some(p) => p.parse().map_err(|_| format!("invalid server version '{}'", s)),
                None => Ok(0),
            }
        };
        let major = match parts.next() {
            Some(p) if !p.is_empty() => parse(Some(p))?,
            _ => return Err(format!("invalid server version '{}'", s)),
        };
        let minor = parse(parts.next())?;
        Ok(ServerVersion::new(major, minor))
    }
}

/// A server feature the translator may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// `$expr` inside `$match`
    ExprOperator,
    /// `$toInt`, `$toLong`, `$toDouble`, `$toDecimal`, `$toString`
    ConversionOperators,
    ReplaceWith,
    RegexMatch,
    ReplaceAll,
    DateAdd,
    /// `limit` argument of `$filter`
    FilterLimit,
}

impl Feature {
    pub fn first_supported(self) -> ServerVersion {
        match self {
            Feature::ExprOperator => ServerVersion::new(3, 6),
            Feature::ConversionOperators => ServerVersion::new(4, 0),
            Feature::ReplaceWith | Feature::RegexMatch => ServerVersion::new(4, 2),
            Feature::ReplaceAll => ServerVersion::new(4, 4),
            Feature::DateAdd => ServerVersion::new(5, 0),
            Feature::FilterLimit => ServerVersion::new(5, 2),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::ExprOperator => "$expr",
            Feature::ConversionOperators => "conversion operators",
            Feature::ReplaceWith => "$replaceWith",
            Feature::RegexMatch => "$regexMatch",
            Feature::ReplaceAll => "$replaceAll",
            Feature::DateAdd => "$dateAdd",
            Feature::FilterLimit => "$filter limit",
        }
    }
}

/// What the target server supports.
///
/// # Examples
///
/// ```
/// use docstage::{Capabilities, Feature};
///
/// let caps = Capabilities::for_version("4.0".parse().unwrap());
/// assert!(caps.supports(Feature::ExprOperator));
/// assert!(!caps.supports(Feature::ReplaceWith));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    version: ServerVersion,
    disabled: Vec<Feature>,
}

impl Capabilities {
    pub fn for_version(version: ServerVersion) -> Self {
        Capabilities { version, disabled: Vec::new() }
    }

    /// Treat a feature as unavailable regardless of version.
    pub fn without(mut self, feature: Feature) -> Self {
        if !self.disabled.contains(&feature) {
            self.disabled.push(feature);
        }
        self
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.version >= feature.first_supported() && !self.disabled.contains(&feature)
    }

    pub fn require(&self, feature: Feature) -> Result<(), TranslationError> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(TranslationError::FeatureNotSupported {
                feature: feature.name().to_string(),
                required: feature.first_supported(),
                actual: self.version,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationOptions {
    /// Run untranslatable operators on the client instead of failing
    pub enable_client_side_fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versions() {
        assert_eq!("4.2".parse::<ServerVersion>(), Ok(ServerVersion::new(4, 2)));
        assert_eq!("6".parse::<ServerVersion>(), Ok(ServerVersion::new(6, 0)));
        assert!("x.1".parse::<ServerVersion>().is_err());
    }

    #[test]
    fn disabled_features_are_unsupported() {
        let caps = Capabilities::default().without(Feature::ExprOperator);
        assert!(!caps.supports(Feature::ExprOperator));
        assert!(caps.require(Feature::ExprOperator).is_err());
        assert!(caps.supports(Feature::DateAdd));
    }
}
