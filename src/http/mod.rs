//! HTTP/1.x on the wire: the request parser, the response writer and the
//! small vocabulary types they share.
//!
//! Exactly one request is read per connection; there is no keep-alive and no
//! chunked transfer coding.

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::{ParseError, Request, RequestHead, SessionIdSource};
pub use response::{Response, ResponseState};

macro_rules! status_codes {
    ($($code:literal $variant:ident $reason:literal;)+) => {
        /// Status codes this server knows a reason phrase for.
        ///
        /// Responses carry their status as a bare `u16`, so applications may
        /// use any code; this enum only supplies names and phrases.
        ///
        /// # Examples
        ///
        /// ```
        /// use servlette::http::StatusCode;
        ///
        /// assert_eq!(StatusCode::from_u16(404), Some(StatusCode::NotFound));
        /// assert_eq!(StatusCode::NotFound.canonical_reason(), "Not Found");
        /// assert_eq!(StatusCode::from_u16(299), None);
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum StatusCode {
            $($variant = $code,)+
        }

        impl StatusCode {
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// The reason phrase written on the status line.
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $(Self::$variant => $reason,)+
                }
            }
        }
    };
}

status_codes! {
    100 Continue "Continue";
    200 Ok "OK";
    201 Created "Created";
    202 Accepted "Accepted";
    204 NoContent "No Content";
    301 MovedPermanently "Moved Permanently";
    302 Found "Found";
    303 SeeOther "See Other";
    304 NotModified "Not Modified";
    307 TemporaryRedirect "Temporary Redirect";
    308 PermanentRedirect "Permanent Redirect";
    400 BadRequest "Bad Request";
    401 Unauthorized "Unauthorized";
    403 Forbidden "Forbidden";
    404 NotFound "Not Found";
    405 MethodNotAllowed "Method Not Allowed";
    408 RequestTimeout "Request Timeout";
    409 Conflict "Conflict";
    410 Gone "Gone";
    411 LengthRequired "Length Required";
    413 PayloadTooLarge "Content Too Large";
    414 UriTooLong "URI Too Long";
    415 UnsupportedMediaType "Unsupported Media Type";
    429 TooManyRequests "Too Many Requests";
    431 RequestHeaderFieldsTooLarge "Request Header Fields Too Large";
    500 InternalServerError "Internal Server Error";
    501 NotImplemented "Not Implemented";
    502 BadGateway "Bad Gateway";
    503 ServiceUnavailable "Service Unavailable";
    504 GatewayTimeout "Gateway Timeout";
    505 HttpVersionNotSupported "HTTP Version Not Supported";
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// 4xx and 5xx.
    pub fn is_error(self) -> bool {
        self.as_u16() >= 400
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", *self as u16, self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> u16 {
        status as u16
    }
}

/// A request method token.
///
/// Methods are not interpreted by the server; servlets branch on them. Any
/// token outside the registered set is kept verbatim in [`Method::Extension`].
///
/// ```
/// use servlette::http::Method;
///
/// assert_eq!("POST".parse::<Method>().unwrap(), Method::Post);
/// assert_eq!("MKCOL".parse::<Method>().unwrap().as_str(), "MKCOL");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Extension(String),
}

const REGISTERED_METHODS: [(&str, Method); 9] = [
    ("GET", Method::Get),
    ("HEAD", Method::Head),
    ("POST", Method::Post),
    ("PUT", Method::Put),
    ("DELETE", Method::Delete),
    ("CONNECT", Method::Connect),
    ("OPTIONS", Method::Options),
    ("TRACE", Method::Trace),
    ("PATCH", Method::Patch),
];

impl Method {
    pub fn as_str(&self) -> &str {
        if let Self::Extension(token) = self {
            return token;
        }
        REGISTERED_METHODS
            .iter()
            .find(|(_, method)| method == self)
            .map(|(token, _)| *token)
            .unwrap_or_default()
    }

    /// RFC 9110 safe methods: GET, HEAD, OPTIONS, TRACE.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Trace)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    /// Method tokens are case-sensitive; `get` is an extension method.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Ok(REGISTERED_METHODS
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, method)| method.clone())
            .unwrap_or_else(|| Self::Extension(token.to_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_is_consistent() {
        for code in [200u16, 302, 400, 404, 408, 431, 500, 503] {
            assert_eq!(StatusCode::from_u16(code).map(StatusCode::as_u16), Some(code));
        }
        assert_eq!(StatusCode::RequestTimeout.to_string(), "408 Request Timeout");
    }

    #[test]
    fn unknown_method_keeps_its_token() {
        let method: Method = "PROPFIND".parse().unwrap();
        assert_eq!(method, Method::Extension("PROPFIND".to_owned()));
        assert_eq!(method.to_string(), "PROPFIND");
        assert!(!method.is_safe());
        assert_eq!("get".parse::<Method>().unwrap(), Method::Extension("get".into()));
    }
}
