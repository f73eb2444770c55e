use crate::error::SpiderError;
use std::fmt;
use url::Url;

/// Key identifying a politeness domain.
///
/// URLs are reduced to `scheme://host[:port]`, with the port left out when it is
/// the scheme's default, so every path on one origin shares a single fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(String);

impl HostKey {
    /// Derives the key for a parsed URL. Fails when the URL has no host.
    pub fn from_url(url: &Url) -> Result<Self, SpiderError> {
        let host = url
            .host_str()
            .ok_or_else(|| SpiderError::InvalidUrl(format!("URL has no host: {url}")))?;

        // `Url` already lower-cases scheme and host and hides default ports.
        let key = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        Ok(Self(key))
    }

    /// Parses `url` and derives its key.
    pub fn parse(url: &str) -> Result<Self, SpiderError> {
        Self::from_url(&Url::parse(url)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_shares_a_key() {
        let a = HostKey::parse("https://Example.COM/a?x=1").unwrap();
        let b = HostKey::parse("https://example.com:443/b").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com");
    }

    #[test]
    fn scheme_and_explicit_port_are_significant() {
        let http = HostKey::parse("http://example.com/").unwrap();
        let https = HostKey::parse("https://example.com/").unwrap();
        let custom = HostKey::parse("http://example.com:8080/").unwrap();
        assert_ne!(http, https);
        assert_ne!(http, custom);
        assert_eq!(custom.to_string(), "http://example.com:8080");
    }

    #[test]
    fn url_without_host_is_rejected() {
        assert!(matches!(
            HostKey::parse("data:text/plain,hello"),
            Err(SpiderError::InvalidUrl(_))
        ));
    }
}
