//! Row-level access rules.
//!
//! The policy lives entirely in this glue layer; the engine never sees
//! it. Rules:
//!
//! - System collections (leading `_`) and schema administration are
//!   superuser-only, reads included.
//! - `users`: anyone may sign up (create); a record is readable and
//!   writable by its owner or a superuser; listing is superuser-only.
//! - Everything else: reads are public, writes require any
//!   authenticated identity.

use plinth_types::{PlinthError, Result, is_system_collection};

use crate::auth::AuthIdentity;

/// What the caller is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read one record by id.
    Read,
    /// Enumerate records.
    List,
    /// Insert a record.
    Create,
    /// Patch or delete a record.
    Write,
}

fn forbidden(reason: &str) -> PlinthError {
    PlinthError::Forbidden { reason: reason.to_string() }
}

/// Checks the policy for `action` on `collection`; `record_id` is the
/// target for record-scoped actions.
///
/// # Errors
///
/// Returns [`PlinthError::Forbidden`] when the policy denies the call.
pub fn check(
    collection: &str,
    action: Action,
    record_id: Option<&str>,
    identity: Option<&AuthIdentity>,
) -> Result<()> {
    let is_superuser = identity.is_some_and(AuthIdentity::is_superuser);
    if is_superuser {
        return Ok(());
    }

    if is_system_collection(collection) {
        return Err(forbidden("system collections require a superuser token"));
    }

    if collection == "users" {
        return match action {
            Action::Create => Ok(()),
            Action::List => Err(forbidden("listing users requires a superuser token")),
            Action::Read | Action::Write => {
                let owns = identity
                    .zip(record_id)
                    .is_some_and(|(ident, id)| ident.collection == "users" && ident.record_id == id);
                if owns {
                    Ok(())
                } else {
                    Err(forbidden("users records are owner-only"))
                }
            },
        };
    }

    match action {
        Action::Read | Action::List => Ok(()),
        Action::Create | Action::Write => {
            if identity.is_some() {
                Ok(())
            } else {
                Err(forbidden("writes require an authenticated token"))
            }
        },
    }
}
