// src/routes/session_routes.rs
//
// Device/session management plus the clinic-scoped security-event feed.
// Session creation itself happens out of band (see bin/mksession.rs).

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, SecurityEventRow},
};

// Safety limit for session extension (can be moved to config later)
const MAX_EXTEND_HOURS: i64 = 24 * 30; // 30 days

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_token_id}", get(get_session))
        .route("/sessions/{session_token_id}/extend", post(extend_session))
        .route("/sessions/{session_token_id}/revoke", post(revoke_session))
        .route("/sessions/revoke_all", post(revoke_all_sessions))
        .route("/security_events", get(list_security_events))
}

async fn record_security_event(
    state: &AppState,
    auth: &AuthContext,
    event_type: &str,
    detail: String,
) {
    // best-effort audit append
    let _ = sqlx::query(
        r#"
        INSERT INTO security_event (clinic_id, user_id, event_type, detail)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(auth.clinic_id)
    .bind(auth.user_id)
    .bind(event_type)
    .bind(detail)
    .execute(&state.db)
    .await;
}

/* =========================
   Session list / detail
   ========================= */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SessionListItem {
    pub session_token_id: Uuid,
    pub device_name: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub data: ListSessionsData,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsData {
    pub sessions: Vec<SessionListItem>,
    pub current_session_token_id: Uuid,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ListSessionsResponse>, ApiError> {
    // "active sessions" only: not revoked, not expired
    let rows: Vec<SessionListItem> = sqlx::query_as::<_, SessionListItem>(
        r#"
        SELECT
            session_token_id,
            device_name,
            expires_at,
            last_seen_at,
            created_at
        FROM session_token
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
        ORDER BY last_seen_at DESC NULLS LAST, created_at DESC
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ListSessionsResponse {
        data: ListSessionsData {
            sessions: rows,
            current_session_token_id: auth.session_token_id,
        },
    }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SessionDetail {
    pub session_token_id: Uuid,
    pub user_id: Uuid,
    pub device_name: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub revoked_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct GetSessionResponse {
    pub data: GetSessionData,
}

#[derive(Debug, Serialize)]
pub struct GetSessionData {
    pub session: SessionDetail,
}

/// GET /api/v1/sessions/{session_token_id}
/// Own session, or any session within the clinic for admin/manager.
pub async fn get_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(session_token_id): Path<Uuid>,
) -> Result<Json<GetSessionResponse>, ApiError> {
    let (sql, bind_user): (&str, bool) = if auth.is_admin() || auth.is_manager() {
        (
            r#"
            SELECT st.session_token_id, st.user_id, st.device_name, st.expires_at,
                   st.created_at, st.last_seen_at, st.revoked_at
            FROM session_token st
            JOIN app_user u ON u.user_id = st.user_id
            WHERE st.session_token_id = $1
              AND u.clinic_id = $2
            "#,
            false,
        )
    } else {
        (
            r#"
            SELECT session_token_id, user_id, device_name, expires_at,
                   created_at, last_seen_at, revoked_at
            FROM session_token
            WHERE session_token_id = $1
              AND user_id = $2
            "#,
            true,
        )
    };

    let mut q = sqlx::query_as::<_, SessionDetail>(sql).bind(session_token_id);
    if bind_user {
        q = q.bind(auth.user_id);
    } else {
        q = q.bind(auth.clinic_id);
    }

    let session = q
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("session"))?;

    Ok(Json(GetSessionResponse {
        data: GetSessionData { session },
    }))
}

/* =========================
   Extend
   ========================= */

#[derive(Debug, Deserialize)]
pub struct ExtendSessionRequest {
    /// Hours to extend, counted from max(now, current expires_at).
    /// Defaults to `state.session_ttl_hours`.
    pub extend_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ExtendSessionResponse {
    pub data: ExtendSessionData,
}

#[derive(Debug, Serialize)]
pub struct ExtendSessionData {
    pub ok: bool,
    pub session_token_id: Uuid,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// POST /api/v1/sessions/{session_token_id}/extend
/// Own sessions only; growth is capped at now + MAX_EXTEND_HOURS.
pub async fn extend_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(session_token_id): Path<Uuid>,
    Json(req): Json<ExtendSessionRequest>,
) -> Result<Json<ExtendSessionResponse>, ApiError> {
    let requested = req.extend_hours.unwrap_or(state.session_ttl_hours);

    if requested <= 0 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "extend_hours must be positive".into(),
        ));
    }
    if requested > MAX_EXTEND_HOURS {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            format!("extend_hours too large (max {MAX_EXTEND_HOURS})"),
        ));
    }

    let expires_row: Option<(chrono::DateTime<chrono::Utc>,)> = sqlx::query_as(
        r#"
        UPDATE session_token
        SET expires_at = LEAST(
              GREATEST(expires_at, now()) + make_interval(hours => $3),
              now() + make_interval(hours => $4)
            )
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
        RETURNING expires_at
        "#,
    )
    .bind(session_token_id)
    .bind(auth.user_id)
    .bind(requested)
    .bind(MAX_EXTEND_HOURS)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let expires_at = expires_row
        .ok_or_else(|| ApiError::not_found("session"))?
        .0;

    record_security_event(
        &state,
        &auth,
        "session.extended",
        format!("session {session_token_id} by {requested}h"),
    )
    .await;

    Ok(Json(ExtendSessionResponse {
        data: ExtendSessionData {
            ok: true,
            session_token_id,
            expires_at,
        },
    }))
}

/* =========================
   Revoke
   ========================= */

#[derive(Debug, Serialize)]
pub struct RevokeOneResponse {
    pub data: RevokeOneData,
}

#[derive(Debug, Serialize)]
pub struct RevokeOneData {
    pub ok: bool,
    pub revoked_session_token_id: Uuid,
}

pub async fn revoke_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(session_token_id): Path<Uuid>,
) -> Result<Json<RevokeOneResponse>, ApiError> {
    // Revoke only your own session (admin override can be added later)
    let res = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(session_token_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::NotFound(
            "NOT_FOUND",
            "session not found, already revoked, or not yours".into(),
        ));
    }

    record_security_event(
        &state,
        &auth,
        "session.revoked",
        format!("session {session_token_id}"),
    )
    .await;

    Ok(Json(RevokeOneResponse {
        data: RevokeOneData {
            ok: true,
            revoked_session_token_id: session_token_id,
        },
    }))
}

#[derive(Debug, Serialize)]
pub struct RevokeAllResponse {
    pub data: RevokeAllData,
}

#[derive(Debug, Serialize)]
pub struct RevokeAllData {
    pub ok: bool,
    pub revoked_count: i64,
}

pub async fn revoke_all_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RevokeAllResponse>, ApiError> {
    // Revoke everything except the current session (and only active ones)
    let res = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
          AND session_token_id <> $2
        "#,
    )
    .bind(auth.user_id)
    .bind(auth.session_token_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    let revoked_count = res.rows_affected() as i64;

    if revoked_count > 0 {
        record_security_event(
            &state,
            &auth,
            "session.revoked_all",
            format!("{revoked_count} sessions"),
        )
        .await;
    }

    Ok(Json(RevokeAllResponse {
        data: RevokeAllData {
            ok: true,
            revoked_count,
        },
    }))
}

/* =========================
   Security events
   ========================= */

#[derive(Debug, Deserialize)]
pub struct SecurityEventsQuery {
    pub limit: Option<i64>,
}

pub async fn list_security_events(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SecurityEventsQuery>,
) -> Result<Json<Vec<SecurityEventRow>>, ApiError> {
    auth.ensure_admin_or_manager()?;

    let limit = q.limit.unwrap_or(50);
    if !(1..=500).contains(&limit) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "limit must be between 1 and 500".into(),
        ));
    }

    let rows: Vec<SecurityEventRow> = sqlx::query_as::<_, SecurityEventRow>(
        r#"
        SELECT event_id, clinic_id, user_id, event_type, detail, created_at
        FROM security_event
        WHERE clinic_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(auth.clinic_id)
    .bind(limit)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}
