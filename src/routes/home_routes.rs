use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Duration, Utc};

use crate::error::ApiError;
use crate::middleware::auth_context::AuthContext;
use crate::models::{AppState, role_to_string};

#[derive(serde::Serialize)]
pub struct HomeResponse {
    pub data: HomeData,
}

#[derive(serde::Serialize)]
pub struct HomeData {
    pub view: String,
    pub today_reservations: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/home", get(home))
}

pub async fn home(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<HomeResponse>, ApiError> {
    let start = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap();
    let start_ts = DateTime::<Utc>::from_naive_utc_and_offset(start, Utc);
    let end_ts = start_ts + Duration::days(1);

    // slot-blocking reservations only (cancelled/no-show excluded)
    let today_reservations: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM reservation
        WHERE clinic_id = $1
          AND start_at >= $2
          AND start_at <  $3
          AND status NOT IN (5, 6)
        "#,
    )
    .bind(auth.clinic_id)
    .bind(start_ts)
    .bind(end_ts)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(HomeResponse {
        data: HomeData {
            view: role_to_string(auth.role),
            today_reservations,
        },
    }))
}
