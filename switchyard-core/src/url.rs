//! Router URLs: `service/<package>/<version>/<process>`, `task/...`, `redirect/<host>/<port>`,
//! each with an optional `?parameters` suffix.

/// A URL split into path segments and raw query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterUrl {
    pub segments: Vec<String>,
    pub parameters: String,
}

/// Where a parsed URL should be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Spawnable service (or one-shot task) from a package.
    Service {
        task: bool,
        package: String,
        version: String,
        process: String,
    },
    Redirect {
        host: String,
        port: u16,
    },
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("URL is empty")]
    Empty,
    #[error("URL {url:?} needs at least {expected} segments, got {actual}")]
    TooFewSegments {
        url: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// Split `url` at the first `?` and the path on `/`, dropping empty segments.
pub fn parse_url(url: &str) -> RouterUrl {
    let (path, parameters) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => (url, ""),
    };
    RouterUrl {
        segments: path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        parameters: parameters.to_string(),
    }
}

impl RouterUrl {
    pub fn scheme(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Path part rejoined, without parameters.
    pub fn path(&self) -> String {
        self.segments.join("/")
    }

    pub fn route(&self) -> Result<Route, UrlError> {
        let scheme = self.scheme().ok_or(UrlError::Empty)?;
        match scheme {
            "service" | "task" => {
                self.require(4)?;
                Ok(Route::Service {
                    task: scheme == "task",
                    package: self.segments[1].clone(),
                    version: self.segments[2].clone(),
                    process: self.segments[3].clone(),
                })
            }
            "redirect" => {
                self.require(3)?;
                let port = self.segments[2]
                    .parse::<u16>()
                    .map_err(|_| UrlError::InvalidPort(self.segments[2].clone()))?;
                Ok(Route::Redirect {
                    host: self.segments[1].clone(),
                    port,
                })
            }
            other => Ok(Route::Unsupported(other.to_string())),
        }
    }

    fn require(&self, expected: usize) -> Result<(), UrlError> {
        if self.segments.len() < expected {
            return Err(UrlError::TooFewSegments {
                url: self.path(),
                expected,
                actual: self.segments.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_url_with_parameters() {
        let u = parse_url("service/Foo/1.0.0/Bar.exe?x=1");
        assert_eq!(u.segments, vec!["service", "Foo", "1.0.0", "Bar.exe"]);
        assert_eq!(u.parameters, "x=1");
        assert_eq!(
            u.route().unwrap(),
            Route::Service {
                task: false,
                package: "Foo".into(),
                version: "1.0.0".into(),
                process: "Bar.exe".into(),
            }
        );
    }

    #[test]
    fn redirect_url_without_parameters() {
        let u = parse_url("redirect/host/80");
        assert_eq!(u.segments, vec!["redirect", "host", "80"]);
        assert_eq!(u.parameters, "");
        assert_eq!(
            u.route().unwrap(),
            Route::Redirect {
                host: "host".into(),
                port: 80
            }
        );
    }

    #[test]
    fn only_first_question_mark_splits() {
        let u = parse_url("task/P/2/run?a=1?b=2");
        assert_eq!(u.parameters, "a=1?b=2");
        assert!(matches!(u.route(), Ok(Route::Service { task: true, .. })));
    }

    #[test]
    fn empty_segments_dropped() {
        let u = parse_url("/service//P/1/x/");
        assert_eq!(u.segments, vec!["service", "P", "1", "x"]);
    }

    #[test]
    fn too_few_segments() {
        let err = parse_url("service/Foo/1.0.0").route().unwrap_err();
        assert_eq!(
            err,
            UrlError::TooFewSegments {
                url: "service/Foo/1.0.0".into(),
                expected: 4,
                actual: 3
            }
        );
        assert!(parse_url("redirect/host").route().is_err());
        assert_eq!(parse_url("").route(), Err(UrlError::Empty));
    }

    #[test]
    fn bad_redirect_port() {
        assert_eq!(
            parse_url("redirect/host/http").route(),
            Err(UrlError::InvalidPort("http".into()))
        );
    }

    #[test]
    fn unknown_scheme() {
        assert_eq!(
            parse_url("ftp/x").route(),
            Ok(Route::Unsupported("ftp".into()))
        );
    }
}
