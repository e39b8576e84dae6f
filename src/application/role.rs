//! Role resolution for gateway requests addressing one todo list.

use axum::http::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::domain::types::Role;
use crate::infra::client::{ClientError, PeerSession};

const LISTS_PREFIX: &str = "/lists/";

/// List id addressed by a path such as `/lists/{id}` or `/lists/{id}/entries`.
pub fn list_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(LISTS_PREFIX)?;
    let id = rest.split('/').next()?;
    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    valid.then_some(id)
}

#[derive(Debug, Deserialize)]
struct CollaboratorView {
    role: Role,
}

/// Look up the caller's role on a list through the todo service.
///
/// Returns `None` when the caller is not a collaborator. The lookup itself
/// goes through the caching client, so repeated requests revalidate.
pub async fn resolve_role(
    session: &PeerSession,
    todo_url: &Url,
    list_id: &str,
    email: &str,
) -> Result<Option<Role>, ClientError> {
    let url = collaborator_url(todo_url, list_id, email)?;
    let response = session.get(url.as_str()).await?;
    if response.status() == StatusCode::NOT_FOUND {
        debug!(list_id, email, "caller is not a collaborator");
        return Ok(None);
    }

    let view: CollaboratorView = response.error_for_status()?.json()?;
    Ok(Some(view.role))
}

/// `{todo_url}/lists/{list_id}/collaborators/{email}`, each segment percent-encoded.
fn collaborator_url(todo_url: &Url, list_id: &str, email: &str) -> Result<Url, ClientError> {
    let mut url = todo_url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|()| ClientError::InvalidUrl {
            url: todo_url.to_string(),
            source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
        })?
        .pop_if_empty()
        .extend(["lists", list_id, "collaborators", email]);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_list_ids() {
        assert_eq!(list_id_from_path("/lists/ab12"), Some("ab12"));
        assert_eq!(list_id_from_path("/lists/ab12/entries/x"), Some("ab12"));
        assert_eq!(list_id_from_path("/lists"), None);
        assert_eq!(list_id_from_path("/lists/"), None);
        assert_eq!(list_id_from_path("/health"), None);
        assert_eq!(list_id_from_path("/lists/%2e%2e"), None);
    }

    #[test]
    fn collaborator_urls_encode_the_email() {
        let base = Url::parse("http://todo.internal/api/").unwrap();

        let url = collaborator_url(&base, "ab12", "a@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "http://todo.internal/api/lists/ab12/collaborators/a@example.com"
        );

        let url = collaborator_url(&base, "ab12", "odd#name?x/y@example.com").unwrap();
        assert_eq!(url.path_segments().map(|s| s.count()), Some(5));
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
        assert_eq!(
            url.as_str(),
            "http://todo.internal/api/lists/ab12/collaborators/odd%23name%3Fx%2Fy@example.com"
        );
    }

    #[test]
    fn opaque_bases_are_rejected() {
        let base = Url::parse("mailto:todo@example.com").unwrap();
        assert!(matches!(
            collaborator_url(&base, "ab12", "a@example.com"),
            Err(ClientError::InvalidUrl { .. })
        ));
    }
}
