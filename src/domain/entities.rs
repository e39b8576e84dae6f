//! Records of the todo service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{error::DomainError, types::Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoList {
    pub list_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoEntry {
    pub list_id: String,
    pub entry_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub list_id: String,
    pub email: String,
    pub role: Role,
}

/// Short random identifier for new records.
pub fn new_record_id() -> String {
    hex::encode(&Uuid::new_v4().as_bytes()[..4])
}

/// Names and texts must carry something besides whitespace.
pub fn require_text(field: &'static str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}
