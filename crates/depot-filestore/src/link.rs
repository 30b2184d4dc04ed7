use anyhow::{bail, Context, Result};
use url::Url;

/// Identity driving an entry's cache key: either a declared content hash or
/// a VCS-style fragment name, never both and never neither for links that
/// carry a fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    /// A trustworthy hex digest declared by the upstream link.
    Hashed(String),
    /// An `egg=<name>` fragment naming a moving target without a hash.
    Fragment(String),
}

/// A remote reference to a package artifact. Immutable once parsed.
///
/// The fragment carries the link's declared identity: `#md5=<hex>` for a
/// content hash, `#egg=<name>` for a VCS-style reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    url: Url,
    md5: Option<String>,
    eggfragment: Option<String>,
}

impl Link {
    /// Parse a link, extracting the declared md5 or egg fragment when
    /// present.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or a declared `md5=` value
    /// is not a 32-character hex digest.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("failed to parse link {raw}"))?;
        let mut md5 = None;
        let mut eggfragment = None;
        if let Some(fragment) = url.fragment() {
            if let Some(digest) = fragment.strip_prefix("md5=") {
                if digest.len() != 32 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                    bail!("link {raw} declares a malformed md5 digest");
                }
                md5 = Some(digest.to_ascii_lowercase());
            } else if let Some(name) = fragment.strip_prefix("egg=") {
                if name.is_empty() {
                    bail!("link {raw} declares an empty egg fragment");
                }
                eggfragment = Some(name.to_string());
            }
        }
        Ok(Self {
            url,
            md5,
            eggfragment,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// The URL with any fragment stripped; the form actually fetched.
    #[must_use]
    pub fn url_nofrag(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }

    #[must_use]
    pub fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }

    #[must_use]
    pub fn eggfragment(&self) -> Option<&str> {
        self.eggfragment.as_deref()
    }

    /// Final path segment; the artifact name. Fragments are not part of the
    /// path, so an egg link's basename already excludes its fragment.
    #[must_use]
    pub fn basename(&self) -> &str {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("")
    }

    /// The identity that drives the cache key, if the link declares one.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        match (&self.md5, &self.eggfragment) {
            (Some(digest), None) => Some(Identity::Hashed(digest.clone())),
            (_, Some(name)) => Some(Identity::Fragment(name.clone())),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_md5_fragment() -> Result<()> {
        let digest = "9A0364B9E99BB480DD25E1F0284C8555";
        let link = Link::parse(&format!("https://pypi.org/pkg/pytest-1.2.zip#md5={digest}"))?;
        assert_eq!(link.md5(), Some(digest.to_ascii_lowercase().as_str()));
        assert_eq!(link.eggfragment(), None);
        assert_eq!(link.basename(), "pytest-1.2.zip");
        assert_eq!(link.url_nofrag(), "https://pypi.org/pkg/pytest-1.2.zip");
        assert_eq!(
            link.identity(),
            Some(Identity::Hashed(digest.to_ascii_lowercase()))
        );
        Ok(())
    }

    #[test]
    fn parses_egg_fragment() -> Result<()> {
        let link = Link::parse("https://github.com/pytest/archive/master#egg=pytest-dev")?;
        assert_eq!(link.md5(), None);
        assert_eq!(link.eggfragment(), Some("pytest-dev"));
        assert_eq!(link.basename(), "master");
        assert_eq!(
            link.identity(),
            Some(Identity::Fragment("pytest-dev".to_string()))
        );
        Ok(())
    }

    #[test]
    fn link_without_fragment_has_no_identity() -> Result<()> {
        let link = Link::parse("https://pypi.org/pkg/pytest-1.7.zip")?;
        assert_eq!(link.identity(), None);
        assert_eq!(link.url(), link.url_nofrag());
        Ok(())
    }

    #[test]
    fn rejects_malformed_md5() {
        assert!(Link::parse("https://pypi.org/pkg/p.zip#md5=nothex").is_err());
        assert!(Link::parse("https://pypi.org/pkg/p.zip#md5=abc123").is_err());
    }
}
