//! User administration

use dockyard_common::access::require_role;
use dockyard_common::models::NewUser;
use dockyard_common::{AuditEntry, Error, Result, Role, User};
use tracing::info;

use crate::storage::{audit, Change, Store};

pub async fn list_users(store: &dyn Store, actor: &User) -> Result<Vec<User>> {
    require_role(actor, &[Role::Admin])?;
    store.list_users().await
}

pub async fn create_user(store: &dyn Store, actor: &User, username: &str, role: Role) -> Result<User> {
    require_role(actor, &[Role::Admin])?;
    let username = username.trim();
    if username.is_empty() {
        return Err(Error::validation("username is required"));
    }

    let user = store
        .insert_user(NewUser {
            username: username.to_string(),
            role,
        })
        .await?;

    info!("User {} created with role {}", user.username, role);
    audit(
        store,
        AuditEntry::new(
            Some(actor.id),
            "user_create",
            Some(user.id),
            format!("User {} created with role {}", user.username, role),
        ),
    )
    .await;
    Ok(user)
}

/// Block or unblock a user. The bootstrap admin can never be blocked.
pub async fn set_active(
    store: &dyn Store,
    actor: &User,
    root_username: &str,
    id: i64,
    active: bool,
) -> Result<User> {
    require_role(actor, &[Role::Admin])?;
    let mut user = store
        .get_user(id)
        .await?
        .ok_or_else(|| Error::not_found("user", id))?;
    if user.username == root_username {
        return Err(Error::forbidden(format!(
            "{} cannot be blocked or unblocked",
            root_username
        )));
    }

    user.active = active;
    store.commit(vec![Change::User(user.clone())]).await?;

    let (action, verb) = if active {
        ("user_unblock", "unblocked")
    } else {
        ("user_block", "blocked")
    };
    info!("User {} {} by {}", user.username, verb, actor.username);
    audit(
        store,
        AuditEntry::new(
            Some(actor.id),
            action,
            Some(user.id),
            format!("User {} {}", user.username, verb),
        ),
    )
    .await;
    Ok(user)
}
