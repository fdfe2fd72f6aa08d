//! Checks that a database user may operate the dashboard.

use crate::flatten::flatten;
use http::StatusCode;
use regex::Regex;
use serde_json::Value;
use shared::errors::ErrorClass;
use std::collections::HashSet;
use std::sync::LazyLock;
use topology::errors::ClusterError;
use topology::node::NodeClient;
use topology::sql::{SqlConnector, SqlError};

static GRANT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"GRANT (.+) ON").unwrap());

const ALL_PRIVILEGES: &str = "ALL PRIVILEGES";
const BASE_PRIVILEGES: &[&str] = &["PROCESS", "SHOW DATABASES", "CONFIG"];
const ADMIN_PRIVILEGES: &[&str] = &["SUPER", "DASHBOARD_CLIENT"];
const SEM_PRIVILEGES: &[&str] = &[
    "RESTRICTED_VARIABLES_ADMIN",
    "RESTRICTED_TABLES_ADMIN",
    "RESTRICTED_STATUS_ADMIN",
];
const WRITE_PRIVILEGES: &[&str] = &[ALL_PRIVILEGES, "SUPER", "SYSTEM_VARIABLES_ADMIN"];

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error("could not sign in to the database")]
    DbAuthFailed(#[source] SqlError),
    #[error("the user does not have the privileges required by the dashboard")]
    InsufficientPrivileges,
    #[error("could not read the sql node configuration")]
    NodeConfig(#[source] ClusterError),
    #[error("could not read user grants")]
    Grants(#[source] SqlError),
}

impl ErrorClass for VerifyError {
    fn code(&self) -> &'static str {
        match self {
            VerifyError::DbAuthFailed(_) => "api.user.db_auth_failed",
            VerifyError::InsufficientPrivileges => "api.user.insufficient_privileges",
            VerifyError::NodeConfig(_) | VerifyError::Grants(_) => "api.user.verify_failed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            VerifyError::DbAuthFailed(_) => StatusCode::UNAUTHORIZED,
            VerifyError::InsufficientPrivileges => StatusCode::FORBIDDEN,
            VerifyError::NodeConfig(_) | VerifyError::Grants(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Signs in as the user and checks its grants. Returns whether the user may
/// change cluster settings.
pub async fn verify_db_user(
    sql: &dyn SqlConnector,
    nodes: &NodeClient,
    user: &str,
    password: &str,
) -> Result<bool, VerifyError> {
    let mut conn = sql
        .connect(user, password)
        .await
        .map_err(VerifyError::DbAuthFailed)?;

    let config = flatten(
        &nodes
            .get_config(conn.node())
            .await
            .map_err(VerifyError::NodeConfig)?,
    );
    if flag(config.get("security.skip-grant-table")) {
        return Ok(true);
    }
    let enable_sem = flag(config.get("security.enable-sem"));

    let grants = parse_grants(&conn.show_grants().await.map_err(VerifyError::Grants)?);
    if !has_dashboard_access(&grants, enable_sem) {
        return Err(VerifyError::InsufficientPrivileges);
    }
    Ok(WRITE_PRIVILEGES.iter().any(|p| grants.contains(*p)))
}

fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Privilege names granted by `SHOW GRANTS` lines.
pub fn parse_grants(lines: &[String]) -> HashSet<String> {
    lines
        .iter()
        .filter_map(|line| GRANT_RE.captures(line))
        .filter_map(|captures| captures.get(1))
        .flat_map(|m| m.as_str().split(','))
        .map(|p| p.trim().to_uppercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn has_dashboard_access(grants: &HashSet<String>, enable_sem: bool) -> bool {
    let all = |names: &[&str]| names.iter().all(|p| grants.contains(*p));
    let any = |names: &[&str]| names.iter().any(|p| grants.contains(*p));

    let base = grants.contains(ALL_PRIVILEGES) || (all(BASE_PRIVILEGES) && any(ADMIN_PRIVILEGES));
    if enable_sem {
        base && all(SEM_PRIVILEGES)
    } else {
        base
    }
}
