//! Session variables.
//!
//! A typed set of the session variables a task run may override through its
//! properties. Lookups are case-insensitive. `set_var` rejects unknown names
//! and values that do not parse, which is what routes a run property into the
//! custom-properties bucket instead.

use std::str::FromStr;

use crate::error::VariableError;

/// Names of every recognized session variable.
pub const SESSION_VARIABLE_NAMES: &[&str] = &[
    "query_timeout",
    "query_mem_limit",
    "pipeline_dop",
    "parallel_fragment_exec_instance_num",
    "enable_profile",
    "sql_mode",
    "time_zone",
    "insert_timeout",
];

/// Per-session variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVariables {
    /// Query timeout in seconds.
    pub query_timeout: u32,
    /// Per-query memory limit in bytes (0 = unlimited).
    pub query_mem_limit: u64,
    /// Pipeline degree of parallelism (0 = auto).
    pub pipeline_dop: u32,
    pub parallel_fragment_exec_instance_num: u32,
    pub enable_profile: bool,
    pub sql_mode: String,
    pub time_zone: String,
    /// Insert timeout in seconds.
    pub insert_timeout: u32,
}

impl Default for SessionVariables {
    fn default() -> Self {
        Self {
            query_timeout: 300,
            query_mem_limit: 0,
            pipeline_dop: 0,
            parallel_fragment_exec_instance_num: 1,
            enable_profile: false,
            sql_mode: "ONLY_FULL_GROUP_BY".to_string(),
            time_zone: "UTC".to_string(),
            insert_timeout: 14_400,
        }
    }
}

impl SessionVariables {
    /// Whether `name` is a recognized session variable.
    pub fn is_variable(name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        SESSION_VARIABLE_NAMES.contains(&name.as_str())
    }

    /// Assign a variable from its string form.
    pub fn set_var(&mut self, name: &str, value: &str) -> Result<(), VariableError> {
        let key = name.to_ascii_lowercase();
        match key.as_str() {
            "query_timeout" => self.query_timeout = parse_positive(&key, value)?,
            "query_mem_limit" => self.query_mem_limit = parse_value(&key, value)?,
            "pipeline_dop" => self.pipeline_dop = parse_value(&key, value)?,
            "parallel_fragment_exec_instance_num" => {
                self.parallel_fragment_exec_instance_num = parse_positive(&key, value)?
            }
            "enable_profile" => self.enable_profile = parse_bool(&key, value)?,
            "sql_mode" => self.sql_mode = value.trim().to_ascii_uppercase(),
            "time_zone" => {
                if value.trim().is_empty() {
                    return Err(invalid(&key, value, "time zone must not be empty"));
                }
                self.time_zone = value.trim().to_string();
            }
            "insert_timeout" => self.insert_timeout = parse_positive(&key, value)?,
            _ => return Err(VariableError::Unknown(name.to_string())),
        }
        Ok(())
    }

    /// Read a variable's string form.
    pub fn get_var(&self, name: &str) -> Option<String> {
        let value = match name.to_ascii_lowercase().as_str() {
            "query_timeout" => self.query_timeout.to_string(),
            "query_mem_limit" => self.query_mem_limit.to_string(),
            "pipeline_dop" => self.pipeline_dop.to_string(),
            "parallel_fragment_exec_instance_num" => {
                self.parallel_fragment_exec_instance_num.to_string()
            }
            "enable_profile" => self.enable_profile.to_string(),
            "sql_mode" => self.sql_mode.clone(),
            "time_zone" => self.time_zone.clone(),
            "insert_timeout" => self.insert_timeout.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

fn invalid(name: &str, value: &str, reason: impl Into<String>) -> VariableError {
    VariableError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, VariableError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(name, value, e.to_string()))
}

fn parse_positive(name: &str, value: &str) -> Result<u32, VariableError> {
    let parsed: u32 = parse_value(name, value)?;
    if parsed == 0 {
        return Err(invalid(name, value, "must be greater than zero"));
    }
    Ok(parsed)
}

fn parse_bool(name: &str, value: &str) -> Result<bool, VariableError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(invalid(name, value, "expected a boolean")),
    }
}
