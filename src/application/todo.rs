//! Todo lists, their entries and collaborators.
//!
//! Every write goes through a [`MemoryTable`], so the matching
//! [`MutationEvent`](crate::cache::MutationEvent)s reach cached responses
//! without any explicit invalidation here.

use std::sync::Arc;

use serde::Deserialize;

use crate::application::error::AppError;
use crate::cache::{InvalidationRegistry, Signals};
use crate::domain::{
    entities::{Collaborator, TodoEntry, TodoList, new_record_id, require_text},
    types::Role,
};
use crate::infra::db::{MemoryTable, Record};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTodoList {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTodoEntry {
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTodoEntry {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCollaborator {
    pub email: String,
    pub role: Role,
}

pub struct TodoService {
    signals: Signals,
    lists: MemoryTable<TodoList>,
    entries: MemoryTable<TodoEntry>,
    collaborators: MemoryTable<Collaborator>,
}

impl TodoService {
    pub fn new(signals: Signals) -> Self {
        Self {
            lists: MemoryTable::new(&signals),
            entries: MemoryTable::new(&signals),
            collaborators: MemoryTable::new(&signals),
            signals,
        }
    }

    /// Registry receiving mutations of record type `R`.
    pub fn registry<R: Record>(&self) -> Arc<InvalidationRegistry> {
        self.signals.model(R::MODEL)
    }

    /// Lists `email` collaborates on.
    pub fn lists_for(&self, email: &str) -> Vec<TodoList> {
        let ids: Vec<String> = self
            .collaborators
            .select(|c| c.email == email)
            .into_iter()
            .map(|c| c.list_id)
            .collect();
        self.lists.select(|list| ids.contains(&list.list_id))
    }

    /// Create a list owned by `owner`.
    pub fn create_list(&self, owner: &str, input: CreateTodoList) -> Result<TodoList, AppError> {
        require_text("name", &input.name)?;
        require_text("x-user", owner)?;

        let list = self.lists.create(TodoList {
            list_id: new_record_id(),
            name: input.name,
        })?;
        self.collaborators.create(Collaborator {
            list_id: list.list_id.clone(),
            email: owner.to_string(),
            role: Role::Owner,
        })?;
        Ok(list)
    }

    pub fn list(&self, list_id: &str) -> Result<TodoList, AppError> {
        Ok(self.lists.get(&list_id.to_string())?)
    }

    pub fn rename_list(&self, list_id: &str, input: CreateTodoList) -> Result<TodoList, AppError> {
        require_text("name", &input.name)?;
        Ok(self
            .lists
            .update(&list_id.to_string(), |list| list.name = input.name)?)
    }

    /// Delete a list together with its entries and collaborators.
    pub fn delete_list(&self, list_id: &str) -> Result<(), AppError> {
        self.lists.delete(&list_id.to_string())?;
        self.entries.delete_where(|entry| entry.list_id == list_id);
        self.collaborators.delete_where(|c| c.list_id == list_id);
        Ok(())
    }

    pub fn collaborators(&self, list_id: &str) -> Vec<Collaborator> {
        self.collaborators.select(|c| c.list_id == list_id)
    }

    pub fn collaborator(&self, list_id: &str, email: &str) -> Result<Collaborator, AppError> {
        Ok(self
            .collaborators
            .get(&(list_id.to_string(), email.to_string()))?)
    }

    /// Add or re-role collaborators.
    pub fn merge_collaborators(
        &self,
        list_id: &str,
        input: Vec<CreateCollaborator>,
    ) -> Result<(), AppError> {
        self.list(list_id)?;
        for collaborator in input {
            require_text("email", &collaborator.email)?;
            self.collaborators.merge(Collaborator {
                list_id: list_id.to_string(),
                email: collaborator.email,
                role: collaborator.role,
            });
        }
        Ok(())
    }

    /// Remove collaborators by email. Owners stay.
    pub fn remove_collaborators(&self, list_id: &str, emails: &[String]) -> usize {
        self.collaborators
            .delete_where(|c| {
                c.list_id == list_id && c.role != Role::Owner && emails.contains(&c.email)
            })
            .len()
    }

    pub fn entries(&self, list_id: &str) -> Result<Vec<TodoEntry>, AppError> {
        self.list(list_id)?;
        Ok(self.entries.select(|entry| entry.list_id == list_id))
    }

    pub fn entry(&self, list_id: &str, entry_id: &str) -> Result<TodoEntry, AppError> {
        Ok(self
            .entries
            .get(&(list_id.to_string(), entry_id.to_string()))?)
    }

    pub fn create_entry(&self, list_id: &str, input: CreateTodoEntry) -> Result<TodoEntry, AppError> {
        require_text("text", &input.text)?;
        self.list(list_id)?;
        Ok(self.entries.create(TodoEntry {
            list_id: list_id.to_string(),
            entry_id: new_record_id(),
            text: input.text,
        })?)
    }

    pub fn update_entry(
        &self,
        list_id: &str,
        entry_id: &str,
        input: UpdateTodoEntry,
    ) -> Result<TodoEntry, AppError> {
        let key = (list_id.to_string(), entry_id.to_string());
        let Some(text) = input.text else {
            return self.entry(list_id, entry_id);
        };
        require_text("text", &text)?;
        Ok(self.entries.update(&key, |entry| entry.text = text)?)
    }

    pub fn delete_entry(&self, list_id: &str, entry_id: &str) -> Result<(), AppError> {
        self.entries
            .delete(&(list_id.to_string(), entry_id.to_string()))?;
        Ok(())
    }
}
