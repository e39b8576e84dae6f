use crate::cache::{Fields, InvalidationFilter, fields};
use crate::domain::entities::{Collaborator, TodoEntry, TodoList};

use super::Record;

impl Record for TodoList {
    type Key = String;
    const MODEL: &'static str = "lists";

    fn key(&self) -> Self::Key {
        self.list_id.clone()
    }

    fn fields(&self) -> Fields {
        fields([
            ("list_id", self.list_id.as_str()),
            ("name", self.name.as_str()),
        ])
    }
}

impl Record for TodoEntry {
    type Key = (String, String);
    const MODEL: &'static str = "entries";

    fn key(&self) -> Self::Key {
        (self.list_id.clone(), self.entry_id.clone())
    }

    fn fields(&self) -> Fields {
        fields([
            ("list_id", self.list_id.as_str()),
            ("entry_id", self.entry_id.as_str()),
            ("text", self.text.as_str()),
        ])
    }
}

impl Record for Collaborator {
    type Key = (String, String);
    const MODEL: &'static str = "collaborators";

    fn key(&self) -> Self::Key {
        (self.list_id.clone(), self.email.clone())
    }

    fn fields(&self) -> Fields {
        fields([
            ("list_id", self.list_id.as_str()),
            ("email", self.email.as_str()),
            ("role", self.role.as_str()),
        ])
    }
}

/// Filter on the list a row belongs to.
pub fn by_list(list_id: &str) -> InvalidationFilter {
    InvalidationFilter::new().with("list_id", list_id)
}
