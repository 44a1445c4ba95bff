//! The platform catalogue: which third-party services a session may touch
//! and which secrets each one needs.

use std::fmt;
use std::str::FromStr;

use crate::OrchestratorError;

/// A third-party platform a session can be given credentials for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Confluence,
    Jira,
    Splunk,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Self::Confluence, Self::Jira, Self::Splunk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confluence => "confluence",
            Self::Jira => "jira",
            Self::Splunk => "splunk",
        }
    }

    /// Environment variables holding this platform's credentials.
    pub fn secret_names(&self) -> &'static [&'static str] {
        match self {
            Self::Confluence => &[
                "CONFLUENCE_API_TOKEN",
                "CONFLUENCE_EMAIL",
                "CONFLUENCE_SITE_URL",
            ],
            Self::Jira => &["JIRA_API_TOKEN", "JIRA_EMAIL", "JIRA_SITE_URL"],
            Self::Splunk => &[
                "SPLUNK_URL",
                "SPLUNK_USERNAME",
                "SPLUNK_PASSWORD",
                "SPLUNK_HEC_TOKEN",
            ],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confluence" => Ok(Self::Confluence),
            "jira" => Ok(Self::Jira),
            "splunk" => Ok(Self::Splunk),
            other => Err(OrchestratorError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Parses configured platform names. `all` and `cross-platform` expand to
/// the whole catalogue. Duplicates are dropped, order is kept.
pub fn parse_platforms<S: AsRef<str>>(names: &[S]) -> Result<Vec<Platform>, OrchestratorError> {
    let mut out = Vec::new();
    for name in names {
        let name = name.as_ref();
        let expanded: Vec<Platform> = match name.trim() {
            "all" | "cross-platform" => Platform::ALL.to_vec(),
            single => vec![single.parse()?],
        };
        for platform in expanded {
            if !out.contains(&platform) {
                out.push(platform);
            }
        }
    }
    Ok(out)
}

/// The value passed to the session process to say which platforms it has.
pub fn platform_label(platforms: &[Platform]) -> String {
    match platforms {
        [single] => single.as_str().to_string(),
        _ => "all".to_string(),
    }
}

/// Collects `(name, value)` for every secret the platforms need, using
/// `lookup` to read values. Missing values are skipped.
pub fn collect_secrets(
    platforms: &[Platform],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    let mut secrets = Vec::new();
    for platform in platforms {
        for name in platform.secret_names() {
            match lookup(name) {
                Some(value) => secrets.push(((*name).to_string(), value)),
                None => tracing::debug!(%platform, secret = name, "secret not set"),
            }
        }
    }
    secrets
}
