//! Connection descriptor cleanup and structural parsing.
//!
//! Descriptors frequently arrive damaged: pasted across lines, wrapped in
//! whitespace, or still carrying their `DATABASE_URL=` assignment. Passwords may
//! contain `@` or `#`, so the userinfo is split at the last `@` before the path
//! rather than handed to a strict URL parser.

use std::fmt;

use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::StorageError;

pub const DEFAULT_USERNAME: &str = "postgres";
pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const RECOGNIZED_SCHEMES: [&str; 2] = ["postgres", "postgresql"];

/// Strip whitespace, embedded CR/LF and any leading `VAR=` assignments.
pub fn sanitize_descriptor(raw: &str, var_name: &str) -> String {
    let mut cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    if !var_name.is_empty() {
        let prefix = format!("{var_name}=");
        while let Some(rest) = cleaned.strip_prefix(&prefix) {
            cleaned = rest.trim().to_string();
        }
    }
    cleaned.trim().to_string()
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub scheme: String,
    pub username: String,
    pub password: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub database: String,
    pub params: Vec<(String, String)>,
}

impl ConnectionDescriptor {
    /// Parse an already-sanitized descriptor, applying defaults for absent parts.
    pub fn parse(cleaned: &str) -> Result<Self, StorageError> {
        let (scheme, rest) = cleaned.split_once("://").ok_or_else(|| {
            StorageError::Configuration("connection descriptor has no scheme".to_string())
        })?;

        let (before_query, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };

        let host_start = before_query.rfind('@').map(|at| at + 1).unwrap_or(0);
        let (authority, path) = match before_query[host_start..].find('/') {
            Some(slash) => before_query.split_at(host_start + slash),
            None => (before_query, ""),
        };

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (userinfo, hostport),
            None => ("", authority),
        };

        let (username, password) = match userinfo.split_once(':') {
            Some((user, pass)) => (user, Some(pass)),
            None => (userinfo, None),
        };

        let (hostname, port) = match hostport.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                let port = if port.is_empty() {
                    DEFAULT_PORT
                } else {
                    port.parse::<u16>().map_err(|_| {
                        StorageError::Configuration(format!("invalid port {port:?}"))
                    })?
                };
                (host, port)
            }
            _ => (hostport, DEFAULT_PORT),
        };

        let params = query
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            username: non_empty_or(username, DEFAULT_USERNAME),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            hostname: non_empty_or(hostname, DEFAULT_HOSTNAME),
            port,
            database: path.trim_start_matches('/').to_string(),
            params,
        })
    }

    /// Recognized relational scheme with a username and database path.
    pub fn is_usable(&self) -> bool {
        RECOGNIZED_SCHEMES.contains(&self.scheme.as_str())
            && !self.username.is_empty()
            && !self.database.is_empty()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_connect_options(&self, default_ssl: PgSslMode) -> PgConnectOptions {
        let ssl_mode = self
            .param("sslmode")
            .and_then(|mode| mode.parse::<PgSslMode>().ok())
            .unwrap_or(default_ssl);
        let mut opts = PgConnectOptions::new()
            .host(&self.hostname)
            .port(self.port)
            .username(&self.username)
            .database(&self.database)
            .ssl_mode(ssl_mode);
        if let Some(password) = &self.password {
            opts = opts.password(password);
        }
        opts
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.password.is_some() { ":*****" } else { "" };
        write!(
            f,
            "{}://{}{}@{}:{}/{}",
            self.scheme, self.username, password, self.hostname, self.port, self.database
        )
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "*****"))
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("params", &self.params)
            .finish()
    }
}
