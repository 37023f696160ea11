//! Authorization predicates over role, ownership and collaborator membership.
//!
//! All predicates are pure. Existence of the target row is the caller's
//! concern and is checked before any of these are evaluated.

use crate::error::{Error, Result};
use crate::models::{Deployment, ImageRequest, Role, User};

/// Whether `user` may view the given image request.
pub fn can_view_request(user: &User, request: &ImageRequest) -> bool {
    match user.role {
        Role::Admin | Role::Operator => true,
        Role::Developer => {
            user.id == request.owner_id
                || user.id == request.created_by
                || request.collaborators.contains(&user.username)
        }
    }
}

/// Editing follows the same rules as viewing.
pub fn can_edit_request(user: &User, request: &ImageRequest) -> bool {
    can_view_request(user, request)
}

/// Whether `user` may start, stop, restart or delete a deployment whose
/// originating request is owned by `owner_id`.
///
/// A developer owner loses control once an operator or admin has stopped the
/// deployment, until it re-enters `deploying` through a privileged action or
/// a commit hook.
pub fn can_manage_deployment(user: &User, deployment: &Deployment, owner_id: i64) -> bool {
    match user.role {
        Role::Admin | Role::Operator => true,
        Role::Developer => user.id == owner_id && !deployment.stopped_by_operator,
    }
}

/// Requests visible to `user`, in their original order.
pub fn filter_visible(rows: Vec<ImageRequest>, user: &User) -> Vec<ImageRequest> {
    rows.into_iter()
        .filter(|row| can_view_request(user, row))
        .collect()
}

/// Require the user to hold one of `roles`.
pub fn require_role(user: &User, roles: &[Role]) -> Result<()> {
    if roles.contains(&user.role) {
        Ok(())
    } else {
        Err(Error::forbidden(format!(
            "role {} may not perform this action",
            user.role
        )))
    }
}
