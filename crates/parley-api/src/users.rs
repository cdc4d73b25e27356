use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};

use parley_gateway::{Gateway, Identity};
use parley_types::api::SearchQuery;

use crate::error::ApiError;

/// Case-insensitive substring match on username, caller excluded.
pub async fn search_users(
    State(gateway): State<Gateway>,
    Query(query): Query<SearchQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let users = gateway
        .chat()
        .search_users(identity.user_id, &query.keyword)
        .await?;
    Ok(Json(users))
}
