//! `/api/pins`: named holds that exempt a closure from age-based deletion.
//!
//! Grounded directly on the teacher's `pins.rs`: pin rows are read and
//! written straight through `sea_orm`, without going through the
//! `Ledger` trait (this service has no other caller for pin CRUD, so
//! there is nothing to share an abstraction with).

use std::collections::HashMap;

use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use lazy_static::lazy_static;
use regex::Regex;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use sea_orm::IntoActiveModel;
use serde::Deserialize;

use niks3::PinName;

use crate::database::entity::closure::Entity as Closure;
use crate::database::entity::pin::{self, Entity as Pin};
use crate::error::{ServerError, ServerResult};
use crate::State;

lazy_static! {
    static ref HASH_PREFIX_RE: Regex = Regex::new(r"^[0-9a-df-np-sv-z]{32}$").unwrap();
}

/// Extracts the 32-character hash prefix from a `/nix/store/<hash>-<name>`
/// path and turns it into the narinfo key that roots its closure.
fn narinfo_key_for_store_path(store_path: &str) -> ServerResult<String> {
    let basename = store_path.rsplit('/').next().unwrap_or(store_path);
    let hash = basename.split('-').next().unwrap_or("");

    if !HASH_PREFIX_RE.is_match(hash) {
        return Err(ServerError::MalformedRequest(format!(
            "{} does not look like a Nix store path",
            store_path
        )));
    }

    Ok(format!("{hash}.narinfo"))
}

#[derive(Debug, Deserialize)]
struct CreatePinRequest {
    store_path: String,
}

/// `POST /api/pins/{name}`: creates or retargets a pin.
#[tracing::instrument(skip_all, fields(name = %name))]
async fn create_pin(
    Extension(state): Extension<State>,
    Path(name): Path<PinName>,
    Json(request): Json<CreatePinRequest>,
) -> ServerResult<StatusCode> {
    let database = state.database().await?;
    let narinfo_key = narinfo_key_for_store_path(&request.store_path)?;

    Closure::find_by_id(narinfo_key.clone())
        .one(database)
        .await
        .map_err(ServerError::database_error)?
        .ok_or_else(|| ServerError::NoSuchClosure {
            key: narinfo_key.clone(),
        })?;

    let now = chrono::Utc::now();
    let existing = Pin::find_by_id(name.as_str().to_owned())
        .one(database)
        .await
        .map_err(ServerError::database_error)?;

    let model = match existing {
        Some(row) => {
            let mut active = row.into_active_model();
            active.narinfo_key = Set(narinfo_key.clone());
            active.store_path = Set(request.store_path.clone());
            active.updated_at = Set(now);
            active
        }
        None => pin::ActiveModel {
            name: Set(name.as_str().to_owned()),
            narinfo_key: Set(narinfo_key.clone()),
            store_path: Set(request.store_path.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        },
    };

    model.save(database).await.map_err(ServerError::database_error)?;

    tracing::info!("Pinned {} to {}", name, request.store_path);

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/pins`.
#[tracing::instrument(skip_all)]
async fn get_pins(Extension(state): Extension<State>) -> ServerResult<Json<HashMap<String, String>>> {
    let database = state.database().await?;
    let pins = Pin::find()
        .all(database)
        .await
        .map_err(ServerError::database_error)?
        .into_iter()
        .map(|pin| (pin.name, pin.store_path))
        .collect();

    Ok(Json(pins))
}

/// `DELETE /api/pins/{name}`.
#[tracing::instrument(skip_all, fields(name = %name))]
async fn delete_pin(
    Extension(state): Extension<State>,
    Path(name): Path<PinName>,
) -> ServerResult<StatusCode> {
    let database = state.database().await?;

    if let Some(pin) = Pin::find_by_id(name.as_str().to_owned())
        .one(database)
        .await
        .map_err(ServerError::database_error)?
    {
        Pin::delete_by_id(pin.name.clone())
            .exec(database)
            .await
            .map_err(ServerError::database_error)?;
        tracing::info!("Deleted pin {}", pin.name);
    } else {
        return Err(ServerError::NoSuchPin {
            name: name.to_string(),
        });
    }

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn get_router() -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/pins", get(get_pins))
        .route("/api/pins/:name", post(create_pin).delete(delete_pin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narinfo_key_for_store_path() {
        let key = narinfo_key_for_store_path(
            "/nix/store/00000000000000000000000000000000-hello-2.12.1",
        )
        .unwrap();

        assert_eq!(key, "00000000000000000000000000000000.narinfo");
    }

    #[test]
    fn test_narinfo_key_rejects_non_store_paths() {
        assert!(narinfo_key_for_store_path("/not/a/store/path").is_err());
        assert!(narinfo_key_for_store_path("").is_err());
        // 'e', 't', 'u', 'o' aren't in the Nix base32 alphabet.
        assert!(narinfo_key_for_store_path(
            "/nix/store/eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee-hello"
        )
        .is_err());
    }
}
