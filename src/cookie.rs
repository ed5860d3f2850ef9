//! Cookie parsing and Set-Cookie formatting.
//!
//! The parser follows RFC 2109 with the compatibility quirks real user
//! agents require: `,` is accepted as an item separator alongside `;`, and
//! malformed input yields no cookies rather than an error.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub comment: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub version: u32,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            comment: None,
            expires: None,
            secure: false,
            version: 0,
        }
    }

    /// A deletion marker: empty value, expiry one day in the past. Sending
    /// this instructs the user agent to discard its stored cookie.
    pub fn expired(name: impl Into<String>) -> Cookie {
        let mut cookie = Cookie::new(name, "");
        cookie.expires = Some(Utc::now() - Duration::days(1));
        cookie
    }

    /// Formats one cookie for a `Set-Cookie` header: a semicolon-joined
    /// attribute list. The primary value, `Path`, `Domain` and `Comment`
    /// are quoted; `Version` is not; `Secure` is a valueless flag. Expiry
    /// uses the `ddd, dd-MMM-yy hh:mm:ss GMT` form in UTC with English
    /// month and day names regardless of locale.
    pub fn format(&self) -> String {
        let mut out = format!("{}=\"{}\"", self.name, self.value);
        if self.version > 0 {
            out.push_str(&format!("; Version={}", self.version));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path=\"{}\"", path));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain=\"{}\"", domain));
        }
        if let Some(comment) = &self.comment {
            out.push_str(&format!("; Comment=\"{}\"", comment));
        }
        if let Some(expires) = &self.expires {
            out.push_str(&format!(
                "; Expires={}",
                expires.format("%a, %d-%b-%y %H:%M:%S GMT")
            ));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

/// Joins formatted cookies into the single `Set-Cookie` line the response
/// emits when no explicit `Set-Cookie` header overrides the cookie table.
pub fn join_set_cookie<'a, I>(cookies: I) -> String
where
    I: IntoIterator<Item = &'a Cookie>,
{
    cookies
        .into_iter()
        .map(Cookie::format)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Collects parsed cookies into a map keyed by name; the last cookie wins
/// on duplicates.
pub fn collect(cookies: Vec<Cookie>) -> HashMap<String, Cookie> {
    let mut map = HashMap::new();
    for cookie in cookies {
        map.insert(cookie.name.clone(), cookie);
    }
    map
}

const TSPECIALS: &[char] = &[
    '(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '/', '[', ']', '?', '=', '{', '}', ' ',
    '\t',
];

fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic() && !TSPECIALS.contains(&c)
}

/// Unquoted values are laxer than RFC 2109 tokens: user agents routinely
/// send `$Path=/` and similar, so only separators and quotes end a value.
fn is_value_char(c: char) -> bool {
    c.is_ascii_graphic() && c != ';' && c != ',' && c != '"'
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).map(|&b| b as char)
    }

    fn token(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_token_char(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            None
        } else {
            std::str::from_utf8(&self.input[start..self.pos]).ok()
        }
    }

    /// A value is an unquoted character run or a double-quoted string.
    /// Quotes are stripped; no escape processing is applied.
    fn value(&mut self) -> Option<String> {
        if self.peek() == Some('"') {
            self.pos += 1;
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == '"' {
                    let text = std::str::from_utf8(&self.input[start..self.pos]).ok()?;
                    self.pos += 1;
                    return Some(text.to_owned());
                }
                self.pos += 1;
            }
            None
        } else {
            let start = self.pos;
            while let Some(c) = self.peek() {
                if is_value_char(c) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if self.pos == start {
                None
            } else {
                std::str::from_utf8(&self.input[start..self.pos])
                    .ok()
                    .map(str::to_owned)
            }
        }
    }

    /// Consumes `;` or `,` with an optional single trailing space. Returns
    /// false at end of input.
    fn separator(&mut self) -> Option<bool> {
        match self.peek() {
            None => Some(false),
            Some(';') | Some(',') => {
                self.pos += 1;
                if self.peek() == Some(' ') {
                    self.pos += 1;
                }
                Some(true)
            }
            Some(_) => None,
        }
    }
}

/// Parses a `Cookie:` header value into the cookies it carries, in order.
///
/// A leading `$Version=<int>` sets the version for subsequent cookies
/// (failing to parse the integer keeps the previous version). `$Path` and
/// `$Domain` attach to the most recently emitted cookie. Malformed syntax
/// yields no cookies at all.
pub fn parse_header(value: &str) -> Vec<Cookie> {
    match try_parse(value) {
        Some(cookies) => cookies,
        None => {
            debug!("malformed cookie header ignored: {:?}", value);
            Vec::new()
        }
    }
}

fn try_parse(header: &str) -> Option<Vec<Cookie>> {
    let mut parser = Parser {
        input: header.as_bytes(),
        pos: 0,
    };
    let mut cookies: Vec<Cookie> = Vec::new();
    let mut version = 0u32;

    loop {
        let name = parser.token()?;
        if parser.peek() != Some('=') {
            return None;
        }
        parser.pos += 1;
        let value = parser.value()?;

        match name {
            "$Version" => {
                if let Ok(v) = value.parse() {
                    version = v;
                }
            }
            "$Path" => cookies.last_mut()?.path = Some(value),
            "$Domain" => cookies.last_mut()?.domain = Some(value),
            _ => {
                let mut cookie = Cookie::new(name, value);
                cookie.version = version;
                cookies.push(cookie);
            }
        }

        if !parser.separator()? {
            return Some(cookies);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_versioned_cookies() {
        let cookies = parse_header("$Version=1; foo=\"bar\"; $Path=/; baz=qux");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "foo");
        assert_eq!(cookies[0].value, "bar");
        assert_eq!(cookies[0].path.as_deref(), Some("/"));
        assert_eq!(cookies[0].version, 1);
        assert_eq!(cookies[1].name, "baz");
        assert_eq!(cookies[1].value, "qux");
    }

    #[test]
    fn comma_is_a_separator_too() {
        let cookies = parse_header("a=1, b=2");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1].name, "b");
        assert_eq!(cookies[1].value, "2");
    }

    #[test]
    fn domain_attaches_to_previous_cookie() {
        let cookies = parse_header("id=44; $Domain=.example.com");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain.as_deref(), Some(".example.com"));
    }

    #[test]
    fn bad_version_number_is_ignored() {
        let cookies = parse_header("$Version=banana; a=1");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].version, 0);
    }

    #[test]
    fn malformed_input_yields_nothing() {
        assert!(parse_header("$Path=/; a=1").is_empty());
        assert!(parse_header("noequals").is_empty());
        assert!(parse_header("a=\"unterminated").is_empty());
        assert!(parse_header("=v").is_empty());
    }

    #[test]
    fn quoted_value_keeps_tspecials() {
        let cookies = parse_header("pref=\"a=b; c\"");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "a=b; c");
    }

    #[test]
    fn format_is_quoted_except_version() {
        let mut cookie = Cookie::new("sid", "abc");
        cookie.version = 1;
        cookie.path = Some("/".to_owned());
        cookie.secure = true;
        assert_eq!(cookie.format(), "sid=\"abc\"; Version=1; Path=\"/\"; Secure");
    }

    #[test]
    fn format_expiry_invariant_locale() {
        let mut cookie = Cookie::new("old", "");
        cookie.expires = Some(Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap());
        assert_eq!(
            cookie.format(),
            "old=\"\"; Expires=Sun, 06-Nov-94 08:49:37 GMT"
        );
    }

    #[test]
    fn expired_marker_is_in_the_past() {
        let cookie = Cookie::expired("kill");
        assert!(cookie.value.is_empty());
        assert!(cookie.expires.unwrap() < Utc::now());
    }

    #[test]
    fn join_concatenates_with_commas() {
        let a = Cookie::new("a", "1");
        let b = Cookie::new("b", "2");
        assert_eq!(join_set_cookie([&a, &b]), "a=\"1\", b=\"2\"");
    }
}
