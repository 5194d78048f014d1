// src/routes/customer_routes.rs

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
    models::AppState,
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CustomerRow {
    pub customer_id: Uuid,
    pub clinic_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub kana: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub note: Option<String>,
    pub status: i16,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/customers", post(create_customer).get(search_customers))
        .route("/customers/{customer_id}", get(get_customer).patch(update_customer))
        .route("/customers/{customer_id}/archive", post(archive_customer))
        .route("/customers/{customer_id}/restore", post(restore_customer))
}

use serde::de::Deserializer;

pub(crate) fn deserialize_double_option<'de, D, T>(
    deserializer: D,
) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Called only when the field is present (even as `null`):
    // null => Some(None) (clear), value => Some(Some(value)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

const CUSTOMER_STATUS_ACTIVE: i16 = 0;
const CUSTOMER_STATUS_ARCHIVED: i16 = 1;

const SELECT_COLUMNS: &str = r#"customer_id, clinic_id, first_name, last_name, kana, phone, email, note, status, created_at, updated_at"#;

#[derive(Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub first_name: String,
    pub last_name: String,
    pub kana: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub note: Option<String>,
}

pub async fn create_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateCustomerRequest>,
) -> Result<Json<CustomerRow>, ApiError> {
    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();

    if first_name.is_empty() || last_name.is_empty() {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "first_name and last_name are required".to_string(),
        ));
    }

    let row: CustomerRow = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        INSERT INTO customer (clinic_id, first_name, last_name, kana, phone, email, note, status, created_at, updated_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7, 0, now(), now())
        RETURNING {SELECT_COLUMNS}
        "#,
    ))
    .bind(auth.clinic_id)
    .bind(first_name)
    .bind(last_name)
    .bind(req.kana.as_deref().map(str::trim))
    .bind(req.phone.as_deref().map(str::trim))
    .bind(req.email.as_deref().map(str::trim))
    .bind(req.note.as_deref())
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(row))
}

pub async fn get_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
) -> Result<Json<CustomerRow>, ApiError> {
    let row: CustomerRow = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM customer
        WHERE customer_id = $1
          AND clinic_id = $2
        "#,
    ))
    .bind(customer_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("customer"))?;

    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
}

pub async fn search_customers(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<CustomerRow>>, ApiError> {
    let query = q.query.unwrap_or_default().trim().to_string();
    if query.is_empty() {
        // default: most recent
        let rows: Vec<CustomerRow> = sqlx::query_as::<_, CustomerRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM customer
            WHERE clinic_id = $1
            ORDER BY created_at DESC
            LIMIT 50
            "#,
        ))
        .bind(auth.clinic_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;
        return Ok(Json(rows));
    }

    let like = format!("%{}%", query);

    let rows: Vec<CustomerRow> = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM customer
        WHERE clinic_id = $1
          AND (first_name ILIKE $2
           OR last_name ILIKE $2
           OR kana ILIKE $2
           OR phone ILIKE $2)
        ORDER BY created_at DESC
        LIMIT 50
        "#,
    ))
    .bind(auth.clinic_id)
    .bind(like)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCustomerRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub kana: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub note: Option<Option<String>>,
}

fn apply_clearable(
    incoming: Option<Option<String>>,
    existing: &Option<String>,
) -> Option<String> {
    match incoming {
        None => existing.clone(),
        Some(None) => None,
        Some(Some(v)) => {
            let t = v.trim();
            if t.is_empty() { None } else { Some(t.to_string()) }
        }
    }
}

pub async fn update_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
    Json(req): Json<UpdateCustomerRequest>,
) -> Result<Json<CustomerRow>, ApiError> {
    // Load existing (clinic-scoped)
    let existing: CustomerRow = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        SELECT {SELECT_COLUMNS}
        FROM customer
        WHERE customer_id = $1
          AND clinic_id = $2
        "#,
    ))
    .bind(customer_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("customer"))?;

    let first_name = match req.first_name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.first_name.clone(),
    };
    let last_name = match req.last_name.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => existing.last_name.clone(),
    };

    let kana = apply_clearable(req.kana, &existing.kana);
    let phone = apply_clearable(req.phone, &existing.phone);
    let email = apply_clearable(req.email, &existing.email);
    let note = apply_clearable(req.note, &existing.note);

    let updated: CustomerRow = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        UPDATE customer
        SET first_name = $1,
            last_name = $2,
            kana = $3,
            phone = $4,
            email = $5,
            note = $6,
            updated_at = now()
        WHERE customer_id = $7
          AND clinic_id = $8
        RETURNING {SELECT_COLUMNS}
        "#,
    ))
    .bind(first_name)
    .bind(last_name)
    .bind(kana)
    .bind(phone)
    .bind(email)
    .bind(note)
    .bind(customer_id)
    .bind(auth.clinic_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(updated))
}

async fn set_customer_status(
    state: &AppState,
    auth: &AuthContext,
    customer_id: Uuid,
    status: i16,
) -> Result<CustomerRow, ApiError> {
    let updated: CustomerRow = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        UPDATE customer
        SET status = $1, updated_at = now()
        WHERE customer_id = $2
          AND clinic_id = $3
        RETURNING {SELECT_COLUMNS}
        "#,
    ))
    .bind(status)
    .bind(customer_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("customer"))?;

    Ok(updated)
}

pub async fn archive_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
) -> Result<Json<CustomerRow>, ApiError> {
    let row = set_customer_status(&state, &auth, customer_id, CUSTOMER_STATUS_ARCHIVED).await?;
    Ok(Json(row))
}

pub async fn restore_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<Uuid>,
) -> Result<Json<CustomerRow>, ApiError> {
    let row = set_customer_status(&state, &auth, customer_id, CUSTOMER_STATUS_ACTIVE).await?;
    Ok(Json(row))
}
