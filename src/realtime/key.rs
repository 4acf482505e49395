//! # Subscription Keys
//!
//! A key names one slice of the change feed: the rows of one table that
//! belong to one user. Keys are validated once, at construction.

use std::fmt;

use serde::Serialize;

use super::errors::{RealtimeError, RealtimeResult};

/// (table, user) pair identifying one provider channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey {
    table: String,
    user_id: String,
}

impl SubscriptionKey {
    /// Build a key, rejecting empty parts and table names the feed cannot address
    pub fn new(table: impl Into<String>, user_id: impl Into<String>) -> RealtimeResult<Self> {
        let table = table.into();
        let user_id = user_id.into();

        if table.trim().is_empty() {
            return Err(RealtimeError::InvalidKey("table name is empty".into()));
        }
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(RealtimeError::InvalidKey(format!(
                "table name '{}' must be [A-Za-z0-9_]",
                table
            )));
        }
        if user_id.trim().is_empty() {
            return Err(RealtimeError::InvalidKey("user id is empty".into()));
        }
        // Commas and whitespace would break the `column=eq.value` filter
        if user_id.chars().any(|c| c == ',' || c.is_whitespace()) {
            return Err(RealtimeError::InvalidKey(format!(
                "user id '{}' contains a separator",
                user_id
            )));
        }

        Ok(Self { table, user_id })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Name of the provider channel serving this key. Distinct keys get
    /// distinct names: the table part never contains `:`.
    pub fn channel_name(&self) -> String {
        format!("{}:{}", self.table, self.user_id)
    }

    /// Row filter restricting the feed to this user's rows
    pub fn row_filter(&self, user_column: &str) -> String {
        format!("{}=eq.{}", user_column, self.user_id)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.user_id)
    }
}
