use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::Deserialize;

use super::SharedState;
use crate::app::models::User;
use crate::auth::AuthUser;
use crate::errors::ApiResult;

const SEARCH_LIMIT: i64 = 20;

pub(super) fn routes() -> Router<SharedState> {
    Router::new().route("/users/search", get(search_users))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

/// Name or email substring search, excluding the caller.
async fn search_users(
    State(state): State<SharedState>,
    auth: AuthUser,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<User>>> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let users = state
        .db
        .call(move |db| db.search_users(&q, SEARCH_LIMIT + 1))
        .await?
        .into_iter()
        .filter(|u| u.id != auth.id)
        .take(SEARCH_LIMIT as usize)
        .collect();
    Ok(Json(users))
}
