//! Admin authorization and the first-admin bootstrap.
//!
//! `users.is_admin` is the single source of truth. With no admin in the
//! system, any signed-in user may claim the role once; after that the only
//! way to add admins is an out-of-band edit (`reelctl grant-admin`).

use log::info;
use thiserror::Error;

use crate::{
    catalog::{Catalog, User},
    session::SessionUser,
};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("no authenticated session")]
    NotAuthenticated,
    /// The caller had no user row; one was created with `is_admin = false`.
    #[error("account created without admin privileges")]
    CreatedNotAdmin,
    #[error("admin privileges required")]
    NotAdmin,
    #[error("admin users already exist")]
    AdminsExist,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Confirms the caller is an admin. A caller without a user row gets one
/// (non-admin) before being turned away.
pub fn check_admin(catalog: &Catalog, caller: Option<&SessionUser>) -> Result<User, AdminError> {
    let caller = caller.ok_or(AdminError::NotAuthenticated)?;

    let user = match catalog.find_user(&caller.id)? {
        Some(user) => user,
        None => {
            let (user, created) = catalog.ensure_user(&caller.id, caller.email_or_empty())?;
            if created {
                info!("created user record for {}", caller.id);
                return Err(AdminError::CreatedNotAdmin);
            }
            user
        }
    };

    if user.is_admin {
        Ok(user)
    } else {
        Err(AdminError::NotAdmin)
    }
}

/// Grants admin to the caller only while no admin exists.
pub fn request_admin(catalog: &Catalog, caller: Option<&SessionUser>) -> Result<User, AdminError> {
    let caller = caller.ok_or(AdminError::NotAuthenticated)?;

    if !catalog.bootstrap_admin(&caller.id, caller.email_or_empty())? {
        return Err(AdminError::AdminsExist);
    }
    info!("bootstrap: granted admin to {}", caller.id);

    catalog
        .find_user(&caller.id)?
        .ok_or_else(|| AdminError::Store(anyhow::anyhow!("bootstrapped user {} not found", caller.id)))
}
