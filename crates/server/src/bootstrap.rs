//! First-boot superuser seeding.

use std::sync::Arc;

use plinth_engine::{Engine, ListOptions};
use plinth_types::{Record, Result, token};
use serde_json::json;
use tracing::{info, warn};

use crate::auth::hash_password;
use crate::config::Config;

/// Seeds the initial superuser when the `_superusers` collection is
/// empty. The password comes from `ADMIN_PASSWORD`, or is generated and
/// logged exactly once.
///
/// # Errors
///
/// Propagates engine faults; an already-seeded database is a no-op.
pub async fn seed_admin(engine: &Arc<Engine>, config: &Config) -> Result<()> {
    let existing = engine
        .list("_superusers", ListOptions { page: 1, per_page: 1, ..Default::default() })
        .await?;
    if existing.total_items > 0 {
        return Ok(());
    }

    let password = match &config.admin_password {
        Some(password) => password.clone(),
        None => {
            let generated = token::new_token(24);
            warn!(
                email = %config.admin_email,
                password = %generated,
                "no ADMIN_PASSWORD set; generated a one-time superuser password"
            );
            generated
        },
    };

    let record = Record::from_value(json!({
        "email": config.admin_email,
        "password": hash_password(&password),
    }))
    .expect("literal object");
    let created = engine.create("_superusers", record).await?;
    info!(email = %config.admin_email, id = created.id().unwrap_or_default(), "seeded superuser");
    Ok(())
}
