use serde_json::Value;

use crate::error::AppError;

/// Verified identity of the caller for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet {
    pub subject: String,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
}

impl ClaimSet {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// A claim that may arrive either as one string or as a list of strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimValue {
    One(String),
    Many(Vec<String>),
}

impl ClaimValue {
    /// Parse a raw JSON claim, rejecting every other shape
    pub fn from_json(name: &str, value: &Value) -> Result<Self, AppError> {
        match value {
            Value::String(s) => Ok(ClaimValue::One(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(AppError::InvalidClaims(format!(
                        "{} claim must contain only strings",
                        name
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ClaimValue::Many),
            _ => Err(AppError::InvalidClaims(format!(
                "{} claim must be a string or a list of strings",
                name
            ))),
        }
    }

    pub fn into_list(self) -> Vec<String> {
        match self {
            ClaimValue::One(s) => vec![s],
            ClaimValue::Many(v) => v,
        }
    }

    /// Like [`ClaimValue::into_list`] but splits a single string on whitespace,
    /// the OAuth encoding of scope lists
    pub fn into_space_delimited_list(self) -> Vec<String> {
        match self {
            ClaimValue::One(s) => s.split_whitespace().map(str::to_string).collect(),
            ClaimValue::Many(v) => v,
        }
    }
}
