use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn release_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^v?(\d+)\.(\d+)(?:\.(\d+))?(?:-([0-9A-Za-z][0-9A-Za-z.\-]*))?$")
            .expect("release pattern is a valid regex")
    })
}

/// A cmus release identifier as typed by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReleaseVersion {
    raw: String,
}

impl ReleaseVersion {
    /// Parse a release identifier in one of the accepted forms:
    /// - "2.10.0" or "v2.10.0"
    /// - "2.10" (patch omitted)
    /// - "2.11.0-rc1" (pre-release suffix)
    pub fn parse(version: &str) -> Result<Self, String> {
        let version = version.trim();
        if version.is_empty() {
            return Err("Version cannot be empty".to_string());
        }

        if version.starts_with('-') {
            return Err(format!(
                "Invalid version '{}'. It looks like a CLI flag.",
                version
            ));
        }

        if !release_pattern().is_match(version) {
            return Err(format!(
                "Invalid version '{}'. Expected a release like '2.10.0' or 'v2.10.0'",
                version
            ));
        }

        Ok(ReleaseVersion {
            raw: version.to_string(),
        })
    }

    /// Get: version as given, without a leading 'v'
    pub fn number(&self) -> &str {
        self.raw.trim_start_matches('v')
    }

    /// Get: upstream tag name (cmus tags carry a 'v' prefix)
    pub fn tag(&self) -> String {
        format!("v{}", self.number())
    }

    /// Get: semantic version, filling in a missing patch component
    pub fn semver(&self) -> Option<semver::Version> {
        let caps = release_pattern().captures(&self.raw)?;
        let patch = caps.get(3).map_or("0", |m| m.as_str());
        let mut text = format!("{}.{}.{}", &caps[1], &caps[2], patch);
        if let Some(pre) = caps.get(4) {
            text.push('-');
            text.push_str(pre.as_str());
        }
        semver::Version::parse(&text).ok()
    }

    /// Check if this is a pre-release such as "2.11.0-rc1"
    pub fn is_prerelease(&self) -> bool {
        self.semver().is_some_and(|v| !v.pre.is_empty())
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
