// src/routes/menu_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{AppState, MenuOptionRow, MenuRow},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_menus).post(create_menu))
        .route("/{menu_id}", patch(update_menu))
        .route("/{menu_id}/options", post(create_option))
}

#[derive(Debug, Serialize)]
pub struct MenuWithOptions {
    #[serde(flatten)]
    pub menu: MenuRow,
    pub options: Vec<MenuOptionRow>,
}

pub async fn list_menus(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<MenuWithOptions>>, ApiError> {
    let menus: Vec<MenuRow> = sqlx::query_as::<_, MenuRow>(
        r#"
        SELECT menu_id, clinic_id, display_name, duration_minutes, price_cents,
               display_order, is_active, created_at, updated_at
        FROM menu
        WHERE clinic_id = $1
          AND is_active = true
        ORDER BY display_order ASC, display_name ASC
        "#,
    )
    .bind(auth.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let options: Vec<MenuOptionRow> = sqlx::query_as::<_, MenuOptionRow>(
        r#"
        SELECT mo.option_id, mo.menu_id, mo.display_name, mo.duration_delta_minutes,
               mo.price_delta_cents, mo.display_order, mo.is_active
        FROM menu_option mo
        JOIN menu m ON m.menu_id = mo.menu_id
        WHERE m.clinic_id = $1
          AND mo.is_active = true
        ORDER BY mo.display_order ASC
        "#,
    )
    .bind(auth.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut out: Vec<MenuWithOptions> = menus
        .into_iter()
        .map(|menu| MenuWithOptions { menu, options: vec![] })
        .collect();
    for opt in options {
        if let Some(entry) = out.iter_mut().find(|m| m.menu.menu_id == opt.menu_id) {
            entry.options.push(opt);
        }
    }

    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct CreateMenuRequest {
    pub display_name: String,
    pub duration_minutes: i32,
    pub price_cents: Option<i32>,
    pub display_order: Option<i32>,
}

pub async fn create_menu(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateMenuRequest>,
) -> Result<Json<MenuRow>, ApiError> {
    auth.ensure_admin_or_manager()?;

    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "display_name is required".into(),
        ));
    }
    if req.duration_minutes <= 0 || req.duration_minutes > 24 * 60 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "duration_minutes must be between 1 and 1440".into(),
        ));
    }

    let row: MenuRow = sqlx::query_as::<_, MenuRow>(
        r#"
        INSERT INTO menu (clinic_id, display_name, duration_minutes, price_cents, display_order, is_active, created_at, updated_at)
        VALUES ($1,$2,$3,$4,$5, true, now(), now())
        RETURNING menu_id, clinic_id, display_name, duration_minutes, price_cents,
                  display_order, is_active, created_at, updated_at
        "#,
    )
    .bind(auth.clinic_id)
    .bind(display_name)
    .bind(req.duration_minutes)
    .bind(req.price_cents.unwrap_or(0))
    .bind(req.display_order.unwrap_or(0))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMenuRequest {
    pub display_name: Option<String>,
    pub duration_minutes: Option<i32>,
    pub price_cents: Option<i32>,
    pub display_order: Option<i32>,
    pub is_active: Option<bool>,
}

pub async fn update_menu(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(menu_id): Path<Uuid>,
    Json(req): Json<UpdateMenuRequest>,
) -> Result<Json<MenuRow>, ApiError> {
    auth.ensure_admin_or_manager()?;

    if let Some(d) = req.duration_minutes {
        if d <= 0 || d > 24 * 60 {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "duration_minutes must be between 1 and 1440".into(),
            ));
        }
    }
    if let Some(name) = req.display_name.as_deref() {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                "display_name must not be empty".into(),
            ));
        }
    }

    let row: MenuRow = sqlx::query_as::<_, MenuRow>(
        r#"
        UPDATE menu
        SET display_name = COALESCE($3, display_name),
            duration_minutes = COALESCE($4, duration_minutes),
            price_cents = COALESCE($5, price_cents),
            display_order = COALESCE($6, display_order),
            is_active = COALESCE($7, is_active),
            updated_at = now()
        WHERE menu_id = $1
          AND clinic_id = $2
        RETURNING menu_id, clinic_id, display_name, duration_minutes, price_cents,
                  display_order, is_active, created_at, updated_at
        "#,
    )
    .bind(menu_id)
    .bind(auth.clinic_id)
    .bind(req.display_name.as_deref().map(str::trim))
    .bind(req.duration_minutes)
    .bind(req.price_cents)
    .bind(req.display_order)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("menu"))?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct CreateOptionRequest {
    pub display_name: String,
    pub duration_delta_minutes: i32,
    pub price_delta_cents: Option<i32>,
    pub display_order: Option<i32>,
}

pub async fn create_option(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(menu_id): Path<Uuid>,
    Json(req): Json<CreateOptionRequest>,
) -> Result<Json<MenuOptionRow>, ApiError> {
    auth.ensure_admin_or_manager()?;

    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "display_name is required".into(),
        ));
    }
    // deltas may be negative (shorter variants) but must leave room
    if req.duration_delta_minutes.abs() > 24 * 60 {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "duration_delta_minutes out of range".into(),
        ));
    }

    // menu must belong to the caller's clinic
    let owned: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT menu_id
        FROM menu
        WHERE menu_id = $1
          AND clinic_id = $2
        "#,
    )
    .bind(menu_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    if owned.is_none() {
        return Err(ApiError::not_found("menu"));
    }

    let row: MenuOptionRow = sqlx::query_as::<_, MenuOptionRow>(
        r#"
        INSERT INTO menu_option (menu_id, display_name, duration_delta_minutes, price_delta_cents, display_order, is_active)
        VALUES ($1,$2,$3,$4,$5, true)
        RETURNING option_id, menu_id, display_name, duration_delta_minutes,
                  price_delta_cents, display_order, is_active
        "#,
    )
    .bind(menu_id)
    .bind(display_name)
    .bind(req.duration_delta_minutes)
    .bind(req.price_delta_cents.unwrap_or(0))
    .bind(req.display_order.unwrap_or(0))
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(row))
}
