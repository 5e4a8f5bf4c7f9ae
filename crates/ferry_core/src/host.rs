use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Error;

static HOST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w[-_.\w+]+)(:\d+)?$").expect("valid host regex"));

/// A validated upstream identifier: a DNS label or IP, with an optional port.
///
/// `Host`s are compared by string equality and form the primary key of a
/// `LoadBalancer`'s upstream set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host(String);

impl Host {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim();
        if !HOST_PATTERN.is_match(raw) {
            return Err(Error::InvalidHostPattern(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The upstream URL this host proxies to.
    pub fn to_url(&self) -> String {
        format!("http://{}", self.0)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Host {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Host::parse(s)
    }
}
