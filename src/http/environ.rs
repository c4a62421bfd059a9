use indexmap::IndexMap;

/// The request environment handed to the application, CGI-style.
///
/// Header names fold into `HTTP_*` keys (`X-Echo` → `HTTP_X_ECHO`), so
/// lookups through [`Environ::header`] are case-insensitive. Repeated
/// headers are comma-joined. `Content-Type`/`Content-Length` keep their
/// unprefixed CGI names.
#[derive(Debug, Default)]
pub struct Environ {
    vars: IndexMap<String, String>,
    body: Vec<u8>,
}

impl Environ {
    pub fn new() -> Environ {
        Environ::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Folds a wire header into the environ, comma-joining repeats.
    pub fn add_header(&mut self, name: &str, value: &str) {
        let key = header_key(name);
        match self.vars.get_mut(&key) {
            Some(existing) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => {
                self.vars.insert(key, value.to_string());
            }
        }
    }

    /// Case-insensitive lookup by wire header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.get(&header_key(name))
    }

    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.get("PATH_INFO").unwrap_or("")
    }

    pub fn query(&self) -> &str {
        self.get("QUERY_STRING").unwrap_or("")
    }

    pub fn protocol(&self) -> &str {
        self.get("SERVER_PROTOCOL").unwrap_or("")
    }

    pub fn remote_addr(&self) -> &str {
        self.get("REMOTE_ADDR").unwrap_or("")
    }

    pub fn remote_port(&self) -> u16 {
        self.get("REMOTE_PORT")
            .and_then(|port| port.parse().ok())
            .unwrap_or(0)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn vars(&self) -> &IndexMap<String, String> {
        &self.vars
    }
}

fn header_key(name: &str) -> String {
    let folded: String = name
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    match folded.as_str() {
        "CONTENT_TYPE" | "CONTENT_LENGTH" => folded,
        _ => format!("HTTP_{}", folded),
    }
}
