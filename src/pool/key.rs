use std::{fmt, str::FromStr};

use http::uri::{Authority, Scheme};

/// The route to an origin server: scheme and authority.
///
/// Connections are pooled per route; two requests with the same route may share
/// a persistent connection.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Route {
    scheme: Scheme,
    authority: Authority,
}

/// A URI could not be turned into a [`Route`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RouteError {
    /// The connection string could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The URI has no scheme.
    #[error("missing scheme in uri: {0}")]
    MissingScheme(http::Uri),

    /// The URI has no authority.
    #[error("missing authority in uri: {0}")]
    MissingAuthority(http::Uri),
}

impl Route {
    /// Create a route from its parts.
    pub fn new(scheme: Scheme, authority: Authority) -> Self {
        Self { scheme, authority }
    }

    /// The route's scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The route's authority.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The host name or address.
    pub fn host(&self) -> &str {
        self.authority.host()
    }

    /// The port, defaulting by scheme when the authority does not name one.
    pub fn port(&self) -> u16 {
        self.authority.port_u16().unwrap_or_else(|| {
            if self.scheme == Scheme::HTTPS {
                443
            } else {
                80
            }
        })
    }

    /// Returns `true` if connections on this route must be secured.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// The value to send in a `Host` header for this route.
    pub fn host_header(&self) -> &str {
        self.authority.as_str()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

impl From<(Scheme, Authority)> for Route {
    fn from(value: (Scheme, Authority)) -> Self {
        Self::new(value.0, value.1)
    }
}

impl TryFrom<&http::Uri> for Route {
    type Error = RouteError;

    fn try_from(value: &http::Uri) -> Result<Self, Self::Error> {
        let scheme = value
            .scheme()
            .cloned()
            .ok_or_else(|| RouteError::MissingScheme(value.clone()))?;
        let authority = value
            .authority()
            .cloned()
            .ok_or_else(|| RouteError::MissingAuthority(value.clone()))?;
        Ok(Self::new(scheme, authority))
    }
}

impl TryFrom<http::Uri> for Route {
    type Error = RouteError;

    fn try_from(value: http::Uri) -> Result<Self, Self::Error> {
        Self::try_from(&value)
    }
}

impl FromStr for Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = http::Uri::from_str(s)?;
        uri.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_from_uri() {
        let uri = http::Uri::from_static("http://localhost:8080/path?query");
        let route: Route = uri.try_into().unwrap();
        assert_eq!(route.scheme(), &Scheme::HTTP);
        assert_eq!(route.host(), "localhost");
        assert_eq!(route.port(), 8080);
        assert_eq!(route.to_string(), "http://localhost:8080");
    }

    #[test]
    fn default_ports() {
        let route: Route = "https://example.com".parse().unwrap();
        assert_eq!(route.port(), 443);
        assert!(route.is_secure());

        let route: Route = "http://example.com".parse().unwrap();
        assert_eq!(route.port(), 80);
        assert_eq!(route.host_header(), "example.com");
    }

    #[test]
    fn missing_parts() {
        assert!(matches!(
            "/relative/path".parse::<Route>(),
            Err(RouteError::MissingScheme(_))
        ));
        assert!(matches!(
            "not a uri".parse::<Route>(),
            Err(RouteError::InvalidUri(_))
        ));
    }

    #[test]
    fn route_from_tuple() {
        let route: Route = (Scheme::HTTP, Authority::from_static("localhost:3000")).into();
        assert_eq!(route.port(), 3000);
    }
}
