// src/routes/settings_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/clinic", get(get_clinic))
        .route("/clinic", patch(update_clinic))
        .route("/clinic/settings", get(list_settings))
        .route("/clinic/settings/{category}/{key}", put(put_setting))
}

/* ============================================================
   Clinic profile
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ClinicResponse {
    pub data: ClinicData,
}

#[derive(Debug, Serialize)]
pub struct ClinicData {
    pub clinic_id: Uuid,
    pub clinic_name: String,
}

pub async fn get_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ClinicResponse>, ApiError> {
    let clinic_name: Option<String> = sqlx::query_scalar(
        r#"
        SELECT clinic_name
        FROM clinic
        WHERE clinic_id = $1
        "#,
    )
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ClinicResponse {
        data: ClinicData {
            clinic_id: auth.clinic_id,
            clinic_name: clinic_name.unwrap_or_else(|| "Clinic".to_string()),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClinicRequest {
    pub clinic_name: String,
}

pub async fn update_clinic(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateClinicRequest>,
) -> Result<Json<ClinicResponse>, ApiError> {
    auth.ensure_admin_or_manager()?;

    let name = req.clinic_name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "clinic_name is required".into(),
        ));
    }
    if name.len() > 128 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "clinic_name is too long (max 128)".into(),
        ));
    }

    let clinic_name: String = sqlx::query_scalar(
        r#"
        UPDATE clinic
        SET clinic_name = $2
        WHERE clinic_id = $1
        RETURNING clinic_name
        "#,
    )
    .bind(auth.clinic_id)
    .bind(name)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("clinic"))?;

    Ok(Json(ClinicResponse {
        data: ClinicData {
            clinic_id: auth.clinic_id,
            clinic_name,
        },
    }))
}

/* ============================================================
   Generic key-value settings, scoped by clinic and category
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SettingRow {
    pub category: String,
    pub setting_key: String,
    pub setting_value: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SettingsQuery {
    pub category: Option<String>,
}

/// Categories and keys are slug-style identifiers, not free text.
fn is_valid_setting_ident(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub async fn list_settings(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SettingsQuery>,
) -> Result<Json<Vec<SettingRow>>, ApiError> {
    let rows: Vec<SettingRow> = match q.category.as_deref().map(str::trim) {
        Some(category) if !category.is_empty() => {
            if !is_valid_setting_ident(category) {
                return Err(ApiError::BadRequest(
                    "VALIDATION_ERROR",
                    "category must be a lowercase identifier".into(),
                ));
            }
            sqlx::query_as::<_, SettingRow>(
                r#"
                SELECT category, setting_key, setting_value, updated_at
                FROM clinic_setting
                WHERE clinic_id = $1
                  AND category = $2
                ORDER BY setting_key ASC
                "#,
            )
            .bind(auth.clinic_id)
            .bind(category)
            .fetch_all(&state.db)
            .await
            .map_err(ApiError::db)?
        }
        _ => sqlx::query_as::<_, SettingRow>(
            r#"
            SELECT category, setting_key, setting_value, updated_at
            FROM clinic_setting
            WHERE clinic_id = $1
            ORDER BY category ASC, setting_key ASC
            "#,
        )
        .bind(auth.clinic_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?,
    };

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    pub value: String,
}

pub async fn put_setting(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((category, key)): Path<(String, String)>,
    Json(req): Json<PutSettingRequest>,
) -> Result<Json<SettingRow>, ApiError> {
    auth.ensure_admin_or_manager()?;

    if !is_valid_setting_ident(&category) || !is_valid_setting_ident(&key) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "category and key must be lowercase identifiers (a-z, 0-9, _)".into(),
        ));
    }
    if req.value.len() > 4096 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "value is too long (max 4096)".into(),
        ));
    }

    let row: SettingRow = sqlx::query_as::<_, SettingRow>(
        r#"
        INSERT INTO clinic_setting (clinic_id, category, setting_key, setting_value, updated_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (clinic_id, category, setting_key)
        DO UPDATE SET setting_value = EXCLUDED.setting_value, updated_at = now()
        RETURNING category, setting_key, setting_value, updated_at
        "#,
    )
    .bind(auth.clinic_id)
    .bind(&category)
    .bind(&key)
    .bind(&req.value)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(row))
}

#[cfg(test)]
mod tests {
    use super::is_valid_setting_ident;

    #[test]
    fn setting_idents() {
        assert!(is_valid_setting_ident("reservation"));
        assert!(is_valid_setting_ident("slot_minutes"));
        assert!(is_valid_setting_ident("v2"));
        assert!(!is_valid_setting_ident(""));
        assert!(!is_valid_setting_ident("Has-Upper"));
        assert!(!is_valid_setting_ident("spa ces"));
        assert!(!is_valid_setting_ident(&"x".repeat(65)));
    }
}
