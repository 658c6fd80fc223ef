//! Credential routing: which tenant database a request talks to.
//!
//! Callers may send their own connection parameters as headers; anything they
//! leave out is taken from the process-wide fallback set. The merge is pure and
//! never touches the network.

use std::fmt;

use axum::http::HeaderMap;

pub const HEADER_DB_HOST: &str = "x-db-host";
pub const HEADER_DB_PORT: &str = "x-db-port";
pub const HEADER_DB_NAME: &str = "x-db-name";
pub const HEADER_DB_USER: &str = "x-db-user";
pub const HEADER_DB_PASSWORD: &str = "x-db-password";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("database configuration incomplete, missing: {}", .missing.join(", "))]
    ConfigurationIncomplete { missing: Vec<&'static str> },
}

/// Unvalidated connection parameters, from a request or from configuration.
#[derive(Default, Clone, PartialEq)]
pub struct ConnectionParams {
    pub host: Option<String>,
    pub port: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectionParams {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            host: get(HEADER_DB_HOST),
            port: get(HEADER_DB_PORT),
            database: get(HEADER_DB_NAME),
            user: get(HEADER_DB_USER),
            password: get(HEADER_DB_PASSWORD),
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Fully resolved parameters for one tenant connection.
#[derive(Clone, PartialEq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Merge request parameters over the fallback set, field by field.
pub fn resolve(
    request: &ConnectionParams,
    fallback: &ConnectionParams,
) -> Result<ConnectionDescriptor, RoutingError> {
    let pick = |req: &Option<String>, fb: &Option<String>| {
        non_blank(req).or_else(|| non_blank(fb)).map(str::to_string)
    };

    let host = pick(&request.host, &fallback.host);
    let port = pick(&request.port, &fallback.port).and_then(|p| p.parse::<u16>().ok());
    let database = pick(&request.database, &fallback.database);
    let user = pick(&request.user, &fallback.user);
    // An empty password is legitimate, so only a missing one falls back.
    let password = request
        .password
        .clone()
        .or_else(|| fallback.password.clone())
        .unwrap_or_default();

    let mut missing = Vec::new();
    if host.is_none() {
        missing.push("host");
    }
    if port.is_none() {
        missing.push("port");
    }
    if database.is_none() {
        missing.push("database");
    }
    if user.is_none() {
        missing.push("user");
    }

    match (host, port, database, user) {
        (Some(host), Some(port), Some(database), Some(user)) => Ok(ConnectionDescriptor {
            host,
            port,
            database,
            user,
            password,
        }),
        _ => Err(RoutingError::ConfigurationIncomplete { missing }),
    }
}
