//! Request-header names derived from CGI variables.
//!
//! The web server delivers HTTP request headers as `HTTP_*` variables with
//! underscores and upper case; this module maps them back to canonical
//! header names. Headers outside the closed set survive as `Extension`
//! variants carrying the canonicalized name.

macro_rules! known_headers {
    ( $( $variant:ident => $name:literal, )* ) => {
        /// An HTTP request header, either one of the RFC 2616 request and
        /// entity headers or an extension header.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum RequestHeader {
            $( $variant, )*
            Extension(String),
        }

        impl RequestHeader {
            /// The canonical header name as it appears on the wire.
            pub fn name(&self) -> &str {
                match self {
                    $( RequestHeader::$variant => $name, )*
                    RequestHeader::Extension(name) => name,
                }
            }

            // Case-insensitive: title-casing cannot reproduce all-caps
            // names like `TE`, but those variables must still map to the
            // closed set.
            fn from_canonical(name: String) -> RequestHeader {
                $(
                    if name.eq_ignore_ascii_case($name) {
                        return RequestHeader::$variant;
                    }
                )*
                RequestHeader::Extension(name)
            }
        }
    };
}

known_headers! {
    Accept => "Accept",
    AcceptCharset => "Accept-Charset",
    AcceptEncoding => "Accept-Encoding",
    AcceptLanguage => "Accept-Language",
    Authorization => "Authorization",
    Expect => "Expect",
    From => "From",
    Host => "Host",
    IfMatch => "If-Match",
    IfModifiedSince => "If-Modified-Since",
    IfNoneMatch => "If-None-Match",
    IfRange => "If-Range",
    IfUnmodifiedSince => "If-Unmodified-Since",
    MaxForwards => "Max-Forwards",
    ProxyAuthorization => "Proxy-Authorization",
    Range => "Range",
    Referer => "Referer",
    Te => "TE",
    UserAgent => "User-Agent",
    Allow => "Allow",
    ContentEncoding => "Content-Encoding",
    ContentLanguage => "Content-Language",
    ContentLength => "Content-Length",
    ContentLocation => "Content-Location",
    ContentMd5 => "Content-MD5",
    ContentRange => "Content-Range",
    ContentType => "Content-Type",
    Expires => "Expires",
    LastModified => "Last-Modified",
    Connection => "Connection",
    Cookie => "Cookie",
}

impl RequestHeader {
    /// Maps a CGI variable name to a header: `HTTP_ACCEPT_CHARSET` becomes
    /// `Accept-Charset`, `HTTP_X_CUSTOM_HEADER` becomes the extension
    /// header `X-Custom-Header`. Variables without the `HTTP_` prefix are
    /// not headers.
    pub fn from_cgi_name(variable: &str) -> Option<RequestHeader> {
        let suffix = variable.strip_prefix("HTTP_")?;
        if suffix.is_empty() {
            return None;
        }
        Some(RequestHeader::from_canonical(canonicalize(suffix)))
    }
}

/// Splits on `_`, title-cases each token, rejoins with `-`.
fn canonicalize(suffix: &str) -> String {
    let mut out = String::with_capacity(suffix.len());
    for (i, token) in suffix.split('_').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = token.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            for c in chars {
                out.extend(c.to_lowercase());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_suffixes_map_to_the_closed_set() {
        assert_eq!(
            RequestHeader::from_cgi_name("HTTP_ACCEPT_CHARSET"),
            Some(RequestHeader::AcceptCharset)
        );
        assert_eq!(
            RequestHeader::from_cgi_name("HTTP_USER_AGENT"),
            Some(RequestHeader::UserAgent)
        );
        assert_eq!(
            RequestHeader::from_cgi_name("HTTP_COOKIE"),
            Some(RequestHeader::Cookie)
        );
        assert_eq!(
            RequestHeader::from_cgi_name("HTTP_TE"),
            Some(RequestHeader::Te)
        );
        assert_eq!(
            RequestHeader::from_cgi_name("HTTP_CONTENT_MD5"),
            Some(RequestHeader::ContentMd5)
        );
    }

    #[test]
    fn unknown_suffixes_become_extensions() {
        assert_eq!(
            RequestHeader::from_cgi_name("HTTP_X_CUSTOM_HEADER"),
            Some(RequestHeader::Extension("X-Custom-Header".to_owned()))
        );
    }

    #[test]
    fn non_http_variables_are_not_headers() {
        assert_eq!(RequestHeader::from_cgi_name("REQUEST_METHOD"), None);
        assert_eq!(RequestHeader::from_cgi_name("HTTP_"), None);
    }

    #[test]
    fn names_are_canonical() {
        assert_eq!(RequestHeader::IfModifiedSince.name(), "If-Modified-Since");
        assert_eq!(RequestHeader::Te.name(), "TE");
        assert_eq!(RequestHeader::ContentMd5.name(), "Content-MD5");
        assert_eq!(
            RequestHeader::Extension("X-Forwarded-For".to_owned()).name(),
            "X-Forwarded-For"
        );
    }
}
