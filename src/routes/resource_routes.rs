// src/routes/resource_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, ResourceRow, RESOURCE_KIND_ROOM, RESOURCE_KIND_STAFF},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_resources).post(create_resource))
        .route("/{resource_id}", patch(update_resource))
}

pub async fn list_resources(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<ResourceRow>>, ApiError> {
    // grid columns, in display order
    let rows: Vec<ResourceRow> = sqlx::query_as::<_, ResourceRow>(
        r#"
        SELECT resource_id, clinic_id, kind, display_name, display_order,
               is_active, created_at, updated_at
        FROM resource
        WHERE clinic_id = $1
          AND is_active = true
        ORDER BY display_order ASC, display_name ASC
        "#,
    )
    .bind(auth.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateResourceRequest {
    pub kind: i16, // 0 staff, 1 room
    pub display_name: String,
    pub display_order: Option<i32>,
}

pub async fn create_resource(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateResourceRequest>,
) -> Result<Json<ResourceRow>, ApiError> {
    auth.ensure_admin_or_manager()?;

    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "display_name is required".into(),
        ));
    }
    if req.kind != RESOURCE_KIND_STAFF && req.kind != RESOURCE_KIND_ROOM {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "kind must be 0 (staff) or 1 (room)".into(),
        ));
    }

    let row: ResourceRow = sqlx::query_as::<_, ResourceRow>(
        r#"
        INSERT INTO resource (clinic_id, kind, display_name, display_order, is_active, created_at, updated_at)
        VALUES ($1,$2,$3,$4, true, now(), now())
        RETURNING resource_id, clinic_id, kind, display_name, display_order,
                  is_active, created_at, updated_at
        "#,
    )
    .bind(auth.clinic_id)
    .bind(req.kind)
    .bind(display_name)
    .bind(req.display_order.unwrap_or(0))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UpdateResourceRequest {
    pub display_name: Option<String>,
    pub display_order: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_resource(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(resource_id): Path<Uuid>,
    Json(req): Json<UpdateResourceRequest>,
) -> Result<Json<ResourceRow>, ApiError> {
    auth.ensure_admin_or_manager()?;

    if let Some(name) = req.display_name.as_deref() {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "display_name must not be empty".into(),
            ));
        }
    }

    let row: ResourceRow = sqlx::query_as::<_, ResourceRow>(
        r#"
        UPDATE resource
        SET display_name = COALESCE($3, display_name),
            display_order = COALESCE($4, display_order),
            is_active = COALESCE($5, is_active),
            updated_at = now()
        WHERE resource_id = $1
          AND clinic_id = $2
        RETURNING resource_id, clinic_id, kind, display_name, display_order,
                  is_active, created_at, updated_at
        "#,
    )
    .bind(resource_id)
    .bind(auth.clinic_id)
    .bind(req.display_name.as_deref().map(str::trim))
    .bind(req.display_order)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("resource"))?;

    Ok(Json(row))
}
