// Tolerant parser for the server capability payload carried by `INFO`.
//
// Servers in the wild emit payloads that are almost, but not quite, JSON:
// trailing commas, empty array slots, and bare address literals such as
// `[2001:db8::1]:4222` inside arrays. A strict JSON parser rejects the whole
// handshake for any of these, so this is a small structural scanner instead.
// It never fails: unknown keys are skipped by structure, and any recognized
// field that is missing or unreadable keeps its default.

/// Server capabilities advertised during the handshake.
///
/// ```
/// use natter_wire::ServerInfo;
///
/// let info = ServerInfo::parse(
///     r#"{"server_id":"s1","max_payload":1048576,"connect_urls":["h1:4222","[2001:db8::1]:4222",],}"#,
/// );
/// assert_eq!(info.server_id, "s1");
/// assert_eq!(info.max_payload, 1048576);
/// assert_eq!(info.connect_urls, vec!["h1:4222", "[2001:db8::1]:4222"]);
/// assert!(!info.auth_required);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_id: String,
    pub version: String,
    /// Runtime version the server was built with.
    pub go: String,
    pub host: String,
    pub port: u16,
    pub proto: u32,
    pub client_id: u64,
    pub auth_required: bool,
    pub ssl_required: bool,
    pub tls_required: bool,
    pub tls_verify: bool,
    pub max_payload: u64,
    /// Alternate server addresses, in the order received. Duplicates are kept.
    pub connect_urls: Vec<String>,
}

impl ServerInfo {
    pub fn parse(input: &str) -> Self {
        let mut info = Self::default();
        let mut scanner = Scanner::new(input);
        scanner.skip_ws();
        scanner.eat(b'{');
        loop {
            let start = scanner.pos;
            scanner.skip_separators();
            match scanner.peek() {
                None | Some(b'}') => break,
                _ => {}
            }
            let key = scanner.key();
            scanner.skip_ws();
            if scanner.eat(b':') {
                scanner.skip_ws();
                let value = scanner.value();
                info.apply(&key, value);
            }
            if scanner.pos == start {
                // Stray byte that fits nowhere; step over it.
                scanner.pos += 1;
            }
        }
        info
    }

    fn apply(&mut self, key: &str, value: Value) {
        match key {
            "server_id" => self.server_id = value.into_text(),
            "version" => self.version = value.into_text(),
            "go" => self.go = value.into_text(),
            "host" => self.host = value.into_text(),
            "port" => self.port = value.number().unwrap_or(0),
            "proto" => self.proto = value.number().unwrap_or(0),
            "client_id" => self.client_id = value.number().unwrap_or(0),
            "auth_required" => self.auth_required = value.flag(),
            "ssl_required" => self.ssl_required = value.flag(),
            "tls_required" => self.tls_required = value.flag(),
            "tls_verify" => self.tls_verify = value.flag(),
            "max_payload" => self.max_payload = value.number().unwrap_or(0),
            "connect_urls" => self.connect_urls = value.into_list(),
            _ => {}
        }
    }
}

enum Value {
    Text(String),
    List(Vec<String>),
    Skipped,
}

impl Value {
    fn into_text(self) -> String {
        match self {
            Value::Text(text) => text,
            Value::List(_) | Value::Skipped => String::new(),
        }
    }

    fn into_list(self) -> Vec<String> {
        match self {
            Value::List(items) => items,
            Value::Text(_) | Value::Skipped => Vec::new(),
        }
    }

    fn flag(&self) -> bool {
        matches!(self, Value::Text(text) if text.eq_ignore_ascii_case("true"))
    }

    fn number<T: std::str::FromStr>(&self) -> Option<T> {
        match self {
            Value::Text(text) => text.parse().ok(),
            Value::List(_) | Value::Skipped => None,
        }
    }
}

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace() || b == b',') {
            self.pos += 1;
        }
    }

    fn key(&mut self) -> String {
        if self.peek() == Some(b'"') {
            return self.string();
        }
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b':' | b',' | b'}') || b.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }

    fn value(&mut self) -> Value {
        match self.peek() {
            Some(b'"') => Value::Text(self.string()),
            Some(b'[') => Value::List(self.list()),
            Some(b'{') => {
                self.skip_nested();
                Value::Skipped
            }
            _ => Value::Text(self.bare(|b| matches!(b, b',' | b'}'))),
        }
    }

    // Reads up to (not including) the first stop byte; the result is trimmed.
    fn bare(&mut self, stop: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if stop(b) {
                break;
            }
            self.pos += 1;
        }
        self.src[start..self.pos].trim().to_string()
    }

    fn string(&mut self) -> String {
        // Opening quote.
        self.pos += 1;
        let mut out = String::new();
        let mut run_start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b'"' => {
                    out.push_str(&self.src[run_start..self.pos]);
                    self.pos += 1;
                    return out;
                }
                b'\\' => {
                    out.push_str(&self.src[run_start..self.pos]);
                    self.pos += 1;
                    self.escape(&mut out);
                    run_start = self.pos;
                }
                _ => self.pos += 1,
            }
        }
        // Unterminated string: keep what was there.
        out.push_str(&self.src[run_start..]);
        out
    }

    fn escape(&mut self, out: &mut String) {
        let Some(b) = self.peek() else {
            return;
        };
        let simple = match b {
            b'n' => Some('\n'),
            b'r' => Some('\r'),
            b't' => Some('\t'),
            b'b' => Some('\u{8}'),
            b'f' => Some('\u{c}'),
            b'"' | b'\\' | b'/' => Some(b as char),
            _ => None,
        };
        if let Some(c) = simple {
            out.push(c);
            self.pos += 1;
            return;
        }
        if b == b'u'
            && let Some(hex) = self.src.get(self.pos + 1..self.pos + 5)
            && let Ok(code) = u32::from_str_radix(hex, 16)
        {
            out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            self.pos += 5;
        }
        // Anything else: drop the backslash and keep the following text as is.
    }

    // Array elements may be quoted strings or bare literals. Bare literals are
    // read up to the next top-level `,` or `]`, so an element like
    // `[::1]:4222` survives its own brackets and colons.
    fn list(&mut self) -> Vec<String> {
        // Opening bracket.
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some(b'}') => break,
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => {
                    self.pos += 1;
                }
                Some(b'"') => {
                    let item = self.string();
                    if !item.is_empty() {
                        items.push(item);
                    }
                    self.skip_ws();
                    // Junk between a closing quote and the next separator.
                    self.bare(|b| matches!(b, b',' | b']' | b'}'));
                }
                Some(b'{') => self.skip_nested(),
                Some(_) => {
                    let item = self.bare_element();
                    if !item.is_empty() {
                        items.push(item);
                    }
                }
            }
        }
        items
    }

    fn bare_element(&mut self) -> String {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'[' => depth += 1,
                b']' if depth > 0 => depth -= 1,
                b',' | b']' | b'}' if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        self.src[start..self.pos].trim().to_string()
    }

    fn skip_nested(&mut self) {
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'"' => {
                    self.string();
                    continue;
                }
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.pos += 1;
                        return;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
    }
}
