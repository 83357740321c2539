use once_cell::sync::Lazy;
use regex::Regex;

/// Substring every avatar URL contains; cheap pre-filter before the regex.
pub const AVATAR_PATH_MARKER: &str = "/avatars/";

pub const DEFAULT_HOSTS: &[&str] = &["cdn.discordapp.com", "media.discordapp.net"];

static DEFAULT_MATCHER: Lazy<AvatarUrlMatcher> = Lazy::new(|| {
    AvatarUrlMatcher::with_hosts(DEFAULT_HOSTS)
        .expect("hard-coded avatar URL pattern to be valid")
});

/// Identity extracted from an avatar URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarRef {
    pub subject_id: String,
    pub hash: String,
}

/// Recognizes `https://<host>/avatars/<digits>/<hash>.<ext>` for a fixed host set.
#[derive(Debug, Clone)]
pub struct AvatarUrlMatcher {
    /// `None` when the host set is empty; nothing matches then.
    pattern: Option<Regex>,
}

impl AvatarUrlMatcher {
    /// Builds a matcher for `hosts`; blank entries are skipped.
    ///
    /// The pattern is anchored at `^https://`, so a URL that merely embeds an
    /// avatar URL (a proxy or redirect link) is not recognized. After the hash
    /// there must be a dot and a non-empty run of ASCII letters or digits; a
    /// bare `hash.` or an extension starting with anything else does not match.
    pub fn with_hosts<H: AsRef<str>>(hosts: &[H]) -> Result<Self, regex::Error> {
        let alternatives = hosts
            .iter()
            .map(|host| regex::escape(host.as_ref().trim()))
            .filter(|host| !host.is_empty())
            .collect::<Vec<_>>()
            .join("|");
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = Regex::new(&format!(
            r"^https://(?:{alternatives})/avatars/(\d+)/([^/?#.]+)\.[A-Za-z0-9]+"
        ))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn parse(&self, url: &str) -> Option<AvatarRef> {
        let caps = self.pattern.as_ref()?.captures(url)?;
        Some(AvatarRef {
            subject_id: caps[1].to_string(),
            hash: caps[2].to_string(),
        })
    }
}

impl Default for AvatarUrlMatcher {
    fn default() -> Self {
        DEFAULT_MATCHER.clone()
    }
}

/// Matches against the default host set.
pub fn match_avatar_url(url: &str) -> Option<AvatarRef> {
    DEFAULT_MATCHER.parse(url)
}
