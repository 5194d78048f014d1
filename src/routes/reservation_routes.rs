// src/routes/reservation_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, ReservationStatus},
    schedule::{self, BookedInterval},
};

use super::customer_routes::deserialize_double_option;

/*
Roles (app_user.role):
1 admin
2 manager
3 staff
4 receptionist

Admin/manager/receptionist manage the book; staff can view and move
reservations through their status lifecycle.
*/

fn can_manage_reservations(auth: &AuthContext) -> bool {
    matches!(auth.role, 1 | 2 | 4)
}

fn ensure_manage(auth: &AuthContext) -> Result<(), ApiError> {
    if can_manage_reservations(auth) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Only admin/manager/receptionist can manage reservations".into(),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/reservations/day", get(get_reservations_day))
        .route("/reservations/week", get(get_reservations_week))
        .route("/reservations/check", post(check_reservation))
        .route("/reservations/{reservation_id}", get(get_reservation))
        .route("/reservations", post(create_reservation))
        .route("/reservations/{reservation_id}", patch(patch_reservation))
        .route("/reservations/{reservation_id}/confirm", post(mark_confirmed))
        .route("/reservations/{reservation_id}/arrive", post(mark_arrived))
        .route("/reservations/{reservation_id}/start", post(mark_in_service))
        .route("/reservations/{reservation_id}/complete", post(mark_done))
        .route("/reservations/{reservation_id}/cancel", post(mark_cancelled))
        .route("/reservations/{reservation_id}/no_show", post(mark_no_show))
}

/* ============================================================
   Response DTOs
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct PersonBrief {
    pub id: Uuid,
    pub display: String,
}

#[derive(Debug, Serialize)]
pub struct ResourceBrief {
    pub id: Uuid,
    pub display: String,
    pub kind: i16,
}

#[derive(Debug, Serialize)]
pub struct MenuBrief {
    pub id: Uuid,
    pub display: String,
    pub duration_minutes: i32,
}

#[derive(Debug, Serialize)]
pub struct SelectedOptionDto {
    pub option_id: Uuid,
    pub display_name: String,
    pub duration_delta_minutes: i32,
}

#[derive(Debug, Serialize)]
pub struct ReservationBlockDto {
    pub reservation_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: i16,
    pub note: Option<String>,
    pub customer: PersonBrief,
    pub resource: ResourceBrief,
    pub menu: MenuBrief,
    pub options: Vec<SelectedOptionDto>,
}

#[derive(Debug, Serialize)]
pub struct SuggestedSlotDto {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConflictCheckDto {
    pub has_conflict: bool,
    pub conflicting_ids: Vec<Uuid>,
    pub suggestions: Vec<SuggestedSlotDto>,
}

/* ============================================================
   Per-clinic grid settings (clinic_setting overrides config)
   ============================================================ */

struct GridSettings {
    slot_minutes: i32,
    open_minute: i32,
    close_minute: i32,
}

async fn load_grid_settings(
    state: &AppState,
    clinic_id: Uuid,
) -> Result<GridSettings, ApiError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT setting_key, setting_value
        FROM clinic_setting
        WHERE clinic_id = $1
          AND category = 'reservation'
        "#,
    )
    .bind(clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let mut settings = GridSettings {
        slot_minutes: state.slot_minutes,
        open_minute: state.open_minute,
        close_minute: state.close_minute,
    };

    for (key, value) in rows {
        let Ok(parsed) = value.trim().parse::<i32>() else {
            tracing::warn!("clinic {clinic_id}: non-numeric reservation setting {key}={value}");
            continue;
        };
        match key.as_str() {
            "slot_minutes" if (1..=240).contains(&parsed) => settings.slot_minutes = parsed,
            "open_minute" if (0..1440).contains(&parsed) => settings.open_minute = parsed,
            "close_minute" if (1..=1440).contains(&parsed) => settings.close_minute = parsed,
            _ => {}
        }
    }

    if settings.open_minute >= settings.close_minute {
        // broken override; fall back entirely
        settings.open_minute = state.open_minute;
        settings.close_minute = state.close_minute;
    }

    Ok(settings)
}

/* ============================================================
   Conflict scan plumbing
   ============================================================ */

/// Active (slot-blocking) reservations of one resource for the day around
/// `start_at`. Statuses 5/6 (cancelled, no-show) release their slot.
async fn load_day_intervals<'e, E>(
    executor: E,
    clinic_id: Uuid,
    resource_id: Uuid,
    day_start: DateTime<Utc>,
) -> Result<Vec<BookedInterval>, ApiError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let day_end = day_start + Duration::days(1);
    let rows = sqlx::query(
        r#"
        SELECT reservation_id, start_at, end_at
        FROM reservation
        WHERE clinic_id = $1
          AND resource_id = $2
          AND start_at < $4
          AND end_at > $3
          AND status NOT IN (5, 6)
        ORDER BY start_at ASC
        "#,
    )
    .bind(clinic_id)
    .bind(resource_id)
    .bind(day_start)
    .bind(day_end)
    .fetch_all(executor)
    .await
    .map_err(ApiError::db)?;

    rows.into_iter()
        .map(|r| {
            Ok(BookedInterval {
                reservation_id: r.try_get("reservation_id").map_err(internal_row)?,
                start_at: r.try_get("start_at").map_err(internal_row)?,
                end_at: r.try_get("end_at").map_err(internal_row)?,
            })
        })
        .collect()
}

fn day_start_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(
        ts.date_naive().and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    )
}

fn conflict_payload(
    conflicting_ids: Vec<Uuid>,
    suggestions: Vec<SuggestedSlotDto>,
) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "code": "RESERVATION_CONFLICT",
            "message": "Requested time overlaps an existing reservation",
            "conflicting_ids": conflicting_ids,
            "suggestions": suggestions,
        }
    })
}

/// Run the linear conflict scan for a candidate interval and, on conflict,
/// build same-day alternatives from the intervals already in hand.
fn scan_for_conflicts(
    intervals: &[BookedInterval],
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    exclude: Option<Uuid>,
    grid: &GridSettings,
) -> ConflictCheckDto {
    let conflicting_ids = schedule::find_conflicts(start_at, end_at, intervals, exclude);

    let suggestions = if conflicting_ids.is_empty() {
        vec![]
    } else {
        let others: Vec<BookedInterval> = intervals
            .iter()
            .filter(|b| exclude != Some(b.reservation_id))
            .cloned()
            .collect();
        schedule::suggest_free_slots(
            &others,
            day_start_of(start_at),
            grid.open_minute,
            grid.close_minute,
            (end_at - start_at).num_minutes(),
            grid.slot_minutes,
            5,
        )
        .into_iter()
        .map(|(s, e)| SuggestedSlotDto { start_at: s, end_at: e })
        .collect()
    };

    ConflictCheckDto {
        has_conflict: !conflicting_ids.is_empty(),
        conflicting_ids,
        suggestions,
    }
}

/* ============================================================
   Menu/option lookup for duration derivation
   ============================================================ */

struct MenuSelection {
    duration_minutes: i64,
}

async fn resolve_menu_selection(
    state: &AppState,
    clinic_id: Uuid,
    menu_id: Uuid,
    option_ids: &[Uuid],
) -> Result<MenuSelection, ApiError> {
    let menu_minutes: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT duration_minutes
        FROM menu
        WHERE menu_id = $1
          AND clinic_id = $2
          AND is_active = true
        "#,
    )
    .bind(menu_id)
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(menu_minutes) = menu_minutes else {
        return Err(ApiError::not_found("menu"));
    };

    let mut deltas: Vec<i32> = Vec::with_capacity(option_ids.len());
    for option_id in option_ids {
        let delta: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT duration_delta_minutes
            FROM menu_option
            WHERE option_id = $1
              AND menu_id = $2
              AND is_active = true
            "#,
        )
        .bind(option_id)
        .bind(menu_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?;

        let Some(delta) = delta else {
            return Err(ApiError::BadRequest(
                "VALIDATION_ERROR",
                format!("option {option_id} does not belong to the selected menu"),
            ));
        };
        deltas.push(delta);
    }

    let duration_minutes = schedule::derive_duration_minutes(menu_minutes, &deltas)
        .map_err(|e| ApiError::BadRequest("VALIDATION_ERROR", e.to_string()))?;

    Ok(MenuSelection { duration_minutes })
}

async fn ensure_resource_in_clinic(
    state: &AppState,
    clinic_id: Uuid,
    resource_id: Uuid,
) -> Result<(), ApiError> {
    let exists: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT resource_id
        FROM resource
        WHERE resource_id = $1
          AND clinic_id = $2
          AND is_active = true
        "#,
    )
    .bind(resource_id)
    .bind(clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    if exists.is_none() {
        return Err(ApiError::not_found("resource"));
    }
    Ok(())
}

/* ============================================================
   Query params
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    // YYYY-MM-DD (grid day; DB stores timestamptz)
    pub date: String,
    pub resource_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct WeekQuery {
    pub start: String,
    pub days: Option<i64>,
    pub resource_id: Option<Uuid>,
}

fn parse_grid_date(s: &str) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest("VALIDATION_ERROR", "date must be YYYY-MM-DD".into())
    })?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    ))
}

/* ============================================================
   GET /reservations/day  and  GET /reservations/week
   ============================================================ */

pub async fn get_reservations_day(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DayQuery>,
) -> Result<Json<ApiOk<Vec<ReservationBlockDto>>>, ApiError> {
    let start_ts = parse_grid_date(&q.date)?;
    let end_ts = start_ts + Duration::days(1);
    fetch_blocks(&state, &auth, start_ts, end_ts, q.resource_id).await
}

pub async fn get_reservations_week(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<WeekQuery>,
) -> Result<Json<ApiOk<Vec<ReservationBlockDto>>>, ApiError> {
    let days = q.days.unwrap_or(7);
    if !(1..=14).contains(&days) {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "days must be between 1 and 14".into(),
        ));
    }
    let start_ts = parse_grid_date(&q.start)?;
    let end_ts = start_ts + Duration::days(days);
    fetch_blocks(&state, &auth, start_ts, end_ts, q.resource_id).await
}

async fn fetch_blocks(
    state: &AppState,
    auth: &AuthContext,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    resource_id: Option<Uuid>,
) -> Result<Json<ApiOk<Vec<ReservationBlockDto>>>, ApiError> {
    let rows = sqlx::query(
        r#"
        SELECT
          r.reservation_id,
          r.start_at,
          r.end_at,
          r.status,
          r.note,

          c.customer_id,
          c.first_name AS c_first,
          c.last_name  AS c_last,

          res.resource_id AS res_id,
          res.display_name AS res_name,
          res.kind AS res_kind,

          m.menu_id,
          m.display_name AS menu_name,
          m.duration_minutes AS menu_minutes,

          ro.option_id AS opt_id,
          mo.display_name AS opt_name,
          mo.duration_delta_minutes AS opt_delta

        FROM reservation r
        JOIN customer c ON c.customer_id = r.customer_id
        JOIN resource res ON res.resource_id = r.resource_id
        JOIN menu m ON m.menu_id = r.menu_id
        LEFT JOIN reservation_option ro ON ro.reservation_id = r.reservation_id
        LEFT JOIN menu_option mo ON mo.option_id = ro.option_id

        WHERE r.clinic_id = $1
          AND r.start_at >= $2
          AND r.start_at <  $3
          AND ($4::uuid IS NULL OR r.resource_id = $4)

        ORDER BY r.start_at ASC, mo.display_order ASC
        "#,
    )
    .bind(auth.clinic_id)
    .bind(start_ts)
    .bind(end_ts)
    .bind(resource_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk {
        data: fold_rows_into_blocks(rows)?,
    }))
}

/* ============================================================
   GET /reservations/{id}
   ============================================================ */

pub async fn get_reservation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    let rows = sqlx::query(
        r#"
        SELECT
          r.reservation_id,
          r.start_at,
          r.end_at,
          r.status,
          r.note,

          c.customer_id,
          c.first_name AS c_first,
          c.last_name  AS c_last,

          res.resource_id AS res_id,
          res.display_name AS res_name,
          res.kind AS res_kind,

          m.menu_id,
          m.display_name AS menu_name,
          m.duration_minutes AS menu_minutes,

          ro.option_id AS opt_id,
          mo.display_name AS opt_name,
          mo.duration_delta_minutes AS opt_delta

        FROM reservation r
        JOIN customer c ON c.customer_id = r.customer_id
        JOIN resource res ON res.resource_id = r.resource_id
        JOIN menu m ON m.menu_id = r.menu_id
        LEFT JOIN reservation_option ro ON ro.reservation_id = r.reservation_id
        LEFT JOIN menu_option mo ON mo.option_id = ro.option_id

        WHERE r.reservation_id = $1
          AND r.clinic_id = $2

        ORDER BY mo.display_order ASC
        "#,
    )
    .bind(reservation_id)
    .bind(auth.clinic_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    if rows.is_empty() {
        return Err(ApiError::not_found("reservation"));
    }

    let blocks = fold_rows_into_blocks(rows)?;
    let block = blocks
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal("fold produced no block".into()))?;

    Ok(Json(ApiOk { data: block }))
}

/* ============================================================
   POST /reservations (create)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub customer_id: Uuid,
    pub resource_id: Uuid,
    pub menu_id: Uuid,
    pub option_ids: Option<Vec<Uuid>>,
    pub start_at: DateTime<Utc>,
    /// If omitted, derived from menu duration + option deltas.
    pub end_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

pub async fn create_reservation(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateReservationRequest>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    ensure_manage(&auth)?;

    let option_ids = req.option_ids.unwrap_or_default();

    ensure_resource_in_clinic(&state, auth.clinic_id, req.resource_id).await?;

    let customer_exists: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT customer_id
        FROM customer
        WHERE customer_id = $1
          AND clinic_id = $2
        "#,
    )
    .bind(req.customer_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;
    if customer_exists.is_none() {
        return Err(ApiError::not_found("customer"));
    }

    let selection = resolve_menu_selection(&state, auth.clinic_id, req.menu_id, &option_ids).await?;

    let end_at = match req.end_at {
        Some(end) => {
            if end <= req.start_at {
                return Err(ApiError::BadRequest(
                    "VALIDATION_ERROR",
                    "end_at must be > start_at".into(),
                ));
            }
            end
        }
        None => schedule::derive_end(req.start_at, selection.duration_minutes),
    };

    let grid = load_grid_settings(&state, auth.clinic_id).await?;
    let inside = schedule::within_opening_hours(
        req.start_at,
        end_at,
        grid.open_minute,
        grid.close_minute,
    )
    .map_err(|e| ApiError::BadRequest("VALIDATION_ERROR", e.to_string()))?;
    if !inside {
        return Err(ApiError::BadRequest(
            "OUTSIDE_OPENING_HOURS",
            "reservation does not fit within opening hours".into(),
        ));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Serialize writers per resource so the conflict scan holds at commit.
    sqlx::query(r#"SELECT resource_id FROM resource WHERE resource_id = $1 FOR UPDATE"#)
        .bind(req.resource_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    let intervals = load_day_intervals(
        &mut *tx,
        auth.clinic_id,
        req.resource_id,
        day_start_of(req.start_at),
    )
    .await?;

    let check = scan_for_conflicts(&intervals, req.start_at, end_at, None, &grid);
    if check.has_conflict {
        return Err(ApiError::Conflict(conflict_payload(
            check.conflicting_ids,
            check.suggestions,
        )));
    }

    let row = sqlx::query(
        r#"
        INSERT INTO reservation (
          clinic_id,
          customer_id,
          resource_id,
          menu_id,
          start_at,
          end_at,
          status,
          note,
          created_by_user_id,
          updated_by_user_id
        )
        VALUES ($1,$2,$3,$4,$5,$6, 0, $7, $8, $8)
        RETURNING reservation_id
        "#,
    )
    .bind(auth.clinic_id)
    .bind(req.customer_id)
    .bind(req.resource_id)
    .bind(req.menu_id)
    .bind(req.start_at)
    .bind(end_at)
    .bind(req.note)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| ApiError::BadRequest("RESERVATION_CREATE_FAILED", format!("{e}")))?;

    let reservation_id: Uuid = row.try_get("reservation_id").map_err(internal_row)?;

    for option_id in &option_ids {
        sqlx::query(
            r#"
            INSERT INTO reservation_option (reservation_id, option_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(reservation_id)
        .bind(option_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::BadRequest("OPTION_ATTACH_FAILED", format!("{e}")))?;
    }

    tx.commit().await.map_err(ApiError::db)?;

    get_reservation(State(state), auth, Path(reservation_id)).await
}

/* ============================================================
   PATCH /reservations/{id}  (reschedule / reselect)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PatchReservationRequest {
    pub start_at: Option<DateTime<Utc>>,
    /// Explicit end wins; otherwise the duration is preserved on a move
    /// and recomputed on a menu/option change.
    pub end_at: Option<DateTime<Utc>>,
    pub resource_id: Option<Uuid>,
    pub menu_id: Option<Uuid>,
    pub option_ids: Option<Vec<Uuid>>,
    /// Absent = keep, explicit `null` = clear, string = replace.
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub note: Option<Option<String>>,
}

#[derive(Debug, sqlx::FromRow)]
struct ReservationCoreRow {
    resource_id: Uuid,
    menu_id: Uuid,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: i16,
    note: Option<String>,
}

pub async fn patch_reservation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
    Json(req): Json<PatchReservationRequest>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    ensure_manage(&auth)?;

    let existing: ReservationCoreRow = sqlx::query_as::<_, ReservationCoreRow>(
        r#"
        SELECT resource_id, menu_id, start_at, end_at, status, note
        FROM reservation
        WHERE reservation_id = $1
          AND clinic_id = $2
        "#,
    )
    .bind(reservation_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("reservation"))?;

    let status = ReservationStatus::from_i16(existing.status)
        .ok_or_else(|| ApiError::Internal(format!("unknown status {}", existing.status)))?;
    if status.is_terminal() {
        return Err(ApiError::BadRequest(
            "ALREADY_FINALIZED",
            "finished or cancelled reservations cannot be changed".into(),
        ));
    }

    let resource_id = req.resource_id.unwrap_or(existing.resource_id);
    if resource_id != existing.resource_id {
        ensure_resource_in_clinic(&state, auth.clinic_id, resource_id).await?;
    }

    let menu_changed = req.menu_id.is_some_and(|m| m != existing.menu_id);
    let selection_changed = menu_changed || req.option_ids.is_some();
    let menu_id = req.menu_id.unwrap_or(existing.menu_id);

    // Effective option set: replacement when provided, otherwise current rows.
    let option_ids: Vec<Uuid> = match &req.option_ids {
        Some(ids) => ids.clone(),
        None if menu_changed => vec![], // old menu's options cannot carry over
        None => sqlx::query_scalar(
            r#"
            SELECT option_id
            FROM reservation_option
            WHERE reservation_id = $1
            "#,
        )
        .bind(reservation_id)
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?,
    };

    // Validates menu/option ownership even when an explicit end_at will win.
    let selection = if selection_changed {
        Some(resolve_menu_selection(&state, auth.clinic_id, menu_id, &option_ids).await?)
    } else {
        None
    };

    let start_at = req.start_at.unwrap_or(existing.start_at);

    let end_at = match (req.end_at, &selection) {
        (Some(end), _) => end,
        (None, Some(selection)) => schedule::derive_end(start_at, selection.duration_minutes),
        (None, None) => {
            let (_, end) =
                schedule::shift_preserving_duration(existing.start_at, existing.end_at, start_at);
            end
        }
    };

    if end_at <= start_at {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "end_at must be > start_at".into(),
        ));
    }

    let grid = load_grid_settings(&state, auth.clinic_id).await?;
    let inside =
        schedule::within_opening_hours(start_at, end_at, grid.open_minute, grid.close_minute)
            .map_err(|e| ApiError::BadRequest("VALIDATION_ERROR", e.to_string()))?;
    if !inside {
        return Err(ApiError::BadRequest(
            "OUTSIDE_OPENING_HOURS",
            "reservation does not fit within opening hours".into(),
        ));
    }

    // Absent keeps the current note, explicit null clears it.
    let note = match req.note {
        None => existing.note.clone(),
        Some(v) => v,
    };

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // The pre-check above ran outside the transaction; a concurrent cancel or
    // no_show may have landed since. Re-read under lock before writing.
    let status_now: i16 = sqlx::query_scalar(
        r#"
        SELECT status
        FROM reservation
        WHERE reservation_id = $1
          AND clinic_id = $2
        FOR UPDATE
        "#,
    )
    .bind(reservation_id)
    .bind(auth.clinic_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("reservation"))?;
    let status_now = ReservationStatus::from_i16(status_now)
        .ok_or_else(|| ApiError::Internal(format!("unknown status {status_now}")))?;
    if status_now.is_terminal() {
        return Err(ApiError::BadRequest(
            "ALREADY_FINALIZED",
            "finished or cancelled reservations cannot be changed".into(),
        ));
    }

    sqlx::query(r#"SELECT resource_id FROM resource WHERE resource_id = $1 FOR UPDATE"#)
        .bind(resource_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    let intervals =
        load_day_intervals(&mut *tx, auth.clinic_id, resource_id, day_start_of(start_at)).await?;

    let check =
        scan_for_conflicts(&intervals, start_at, end_at, Some(reservation_id), &grid);
    if check.has_conflict {
        return Err(ApiError::Conflict(conflict_payload(
            check.conflicting_ids,
            check.suggestions,
        )));
    }

    sqlx::query(
        r#"
        UPDATE reservation
        SET start_at = $2,
            end_at = $3,
            resource_id = $4,
            menu_id = $5,
            note = $6,
            updated_at = now(),
            updated_by_user_id = $7
        WHERE reservation_id = $1
        "#,
    )
    .bind(reservation_id)
    .bind(start_at)
    .bind(end_at)
    .bind(resource_id)
    .bind(menu_id)
    .bind(note)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| ApiError::BadRequest("RESERVATION_UPDATE_FAILED", format!("{e}")))?;

    if selection_changed {
        sqlx::query(r#"DELETE FROM reservation_option WHERE reservation_id = $1"#)
            .bind(reservation_id)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::db)?;
        for option_id in &option_ids {
            sqlx::query(
                r#"
                INSERT INTO reservation_option (reservation_id, option_id)
                VALUES ($1, $2)
                "#,
            )
            .bind(reservation_id)
            .bind(option_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ApiError::BadRequest("OPTION_ATTACH_FAILED", format!("{e}")))?;
        }
    }

    tx.commit().await.map_err(ApiError::db)?;

    get_reservation(State(state), auth, Path(reservation_id)).await
}

/* ============================================================
   POST /reservations/check  (pure probe, writes nothing)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CheckReservationRequest {
    pub resource_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub exclude_reservation_id: Option<Uuid>,
}

pub async fn check_reservation(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CheckReservationRequest>,
) -> Result<Json<ApiOk<ConflictCheckDto>>, ApiError> {
    if req.end_at <= req.start_at {
        return Err(ApiError::BadRequest(
            "VALIDATION_ERROR",
            "end_at must be > start_at".into(),
        ));
    }
    ensure_resource_in_clinic(&state, auth.clinic_id, req.resource_id).await?;

    let grid = load_grid_settings(&state, auth.clinic_id).await?;
    let intervals = load_day_intervals(
        &state.db,
        auth.clinic_id,
        req.resource_id,
        day_start_of(req.start_at),
    )
    .await?;

    let check = scan_for_conflicts(
        &intervals,
        req.start_at,
        req.end_at,
        req.exclude_reservation_id,
        &grid,
    );

    Ok(Json(ApiOk { data: check }))
}

/* ============================================================
   Status transitions (validated server-side)
   ============================================================ */

fn transition_update_sql(stamp_column: Option<&'static str>) -> String {
    match stamp_column {
        Some(col) => format!(
            r#"
            UPDATE reservation
            SET status = $2,
                {col} = COALESCE({col}, now()),
                updated_at = now(),
                updated_by_user_id = $3
            WHERE reservation_id = $1
              AND status = $4
            "#
        ),
        None => r#"
            UPDATE reservation
            SET status = $2,
                updated_at = now(),
                updated_by_user_id = $3
            WHERE reservation_id = $1
              AND status = $4
            "#
        .to_string(),
    }
}

async fn transition(
    state: AppState,
    auth: AuthContext,
    reservation_id: Uuid,
    next: ReservationStatus,
    stamp_column: Option<&'static str>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    let current: Option<i16> = sqlx::query_scalar(
        r#"
        SELECT status
        FROM reservation
        WHERE reservation_id = $1
          AND clinic_id = $2
        "#,
    )
    .bind(reservation_id)
    .bind(auth.clinic_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?;

    let Some(current) = current else {
        return Err(ApiError::not_found("reservation"));
    };
    let current = ReservationStatus::from_i16(current)
        .ok_or_else(|| ApiError::Internal(format!("unknown status {current}")))?;

    if !current.can_transition(next) {
        return Err(ApiError::BadRequest(
            "INVALID_TRANSITION",
            format!("cannot move reservation from {current:?} to {next:?}"),
        ));
    }

    // The status guard makes the update compare-and-set: if another request
    // moved the reservation between our read and this write, zero rows match
    // and the stale transition is rejected instead of clobbering the winner.
    let sql = transition_update_sql(stamp_column);
    let result = sqlx::query(&sql)
        .bind(reservation_id)
        .bind(next.as_i16())
        .bind(auth.user_id)
        .bind(current.as_i16())
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::BadRequest("RESERVATION_UPDATE_FAILED", format!("{e}")))?;

    if result.rows_affected() == 0 {
        return Err(ApiError::BadRequest(
            "INVALID_TRANSITION",
            "reservation status changed concurrently, reload and retry".into(),
        ));
    }

    if matches!(next, ReservationStatus::Cancelled | ReservationStatus::NoShow) {
        // audit trail entry; best-effort like last_seen touches
        let _ = sqlx::query(
            r#"
            INSERT INTO security_event (clinic_id, user_id, event_type, detail)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(auth.clinic_id)
        .bind(auth.user_id)
        .bind(match next {
            ReservationStatus::NoShow => "reservation.no_show",
            _ => "reservation.cancelled",
        })
        .bind(format!("reservation {reservation_id}"))
        .execute(&state.db)
        .await;
    }

    get_reservation(State(state), auth, Path(reservation_id)).await
}

pub async fn mark_confirmed(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    transition(state, auth, reservation_id, ReservationStatus::Confirmed, Some("confirmed_at")).await
}

pub async fn mark_arrived(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    transition(state, auth, reservation_id, ReservationStatus::Arrived, Some("arrived_at")).await
}

pub async fn mark_in_service(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    transition(state, auth, reservation_id, ReservationStatus::InService, Some("started_at")).await
}

pub async fn mark_done(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    transition(state, auth, reservation_id, ReservationStatus::Done, Some("completed_at")).await
}

pub async fn mark_cancelled(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    transition(state, auth, reservation_id, ReservationStatus::Cancelled, Some("cancelled_at")).await
}

pub async fn mark_no_show(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReservationBlockDto>>, ApiError> {
    transition(state, auth, reservation_id, ReservationStatus::NoShow, None).await
}

/* ============================================================
   Helper: fold joined rows into reservation blocks
   ============================================================ */

fn fold_rows_into_blocks(
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<ReservationBlockDto>, ApiError> {
    use std::collections::BTreeMap;

    let mut map: BTreeMap<(DateTime<Utc>, Uuid), ReservationBlockDto> = BTreeMap::new();

    for r in rows {
        let reservation_id: Uuid = r.try_get("reservation_id").map_err(internal_row)?;
        let start_at: DateTime<Utc> = r.try_get("start_at").map_err(internal_row)?;
        let end_at: DateTime<Utc> = r.try_get("end_at").map_err(internal_row)?;
        let status: i16 = r.try_get("status").map_err(internal_row)?;
        let note: Option<String> = r.try_get("note").map_err(internal_row)?;

        let c_id: Uuid = r.try_get("customer_id").map_err(internal_row)?;
        let c_first: String = r.try_get("c_first").map_err(internal_row)?;
        let c_last: String = r.try_get("c_last").map_err(internal_row)?;

        let res_id: Uuid = r.try_get("res_id").map_err(internal_row)?;
        let res_name: String = r.try_get("res_name").map_err(internal_row)?;
        let res_kind: i16 = r.try_get("res_kind").map_err(internal_row)?;

        let menu_id: Uuid = r.try_get("menu_id").map_err(internal_row)?;
        let menu_name: String = r.try_get("menu_name").map_err(internal_row)?;
        let menu_minutes: i32 = r.try_get("menu_minutes").map_err(internal_row)?;

        let entry = map
            .entry((start_at, reservation_id))
            .or_insert_with(|| ReservationBlockDto {
                reservation_id,
                start_at,
                end_at,
                status,
                note: note.clone(),
                customer: PersonBrief {
                    id: c_id,
                    display: format!("{c_first} {c_last}"),
                },
                resource: ResourceBrief {
                    id: res_id,
                    display: res_name,
                    kind: res_kind,
                },
                menu: MenuBrief {
                    id: menu_id,
                    display: menu_name,
                    duration_minutes: menu_minutes,
                },
                options: vec![],
            });

        let opt_id: Option<Uuid> = r.try_get("opt_id").ok();
        if let Some(option_id) = opt_id {
            let opt_name: String = r.try_get("opt_name").unwrap_or_else(|_| "Option".into());
            let opt_delta: i32 = r.try_get("opt_delta").unwrap_or(0);
            entry.options.push(SelectedOptionDto {
                option_id,
                display_name: opt_name,
                duration_delta_minutes: opt_delta,
            });
        }
    }

    Ok(map.into_values().collect())
}

fn internal_row(e: sqlx::Error) -> ApiError {
    ApiError::Internal(format!("row decode error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_update_guards_on_current_status() {
        // Compare-and-set: concurrent transitions must not overwrite each
        // other, so every variant of the update carries the status guard.
        let stamped = transition_update_sql(Some("cancelled_at"));
        assert!(stamped.contains("AND status = $4"));
        assert!(stamped.contains("cancelled_at = COALESCE(cancelled_at, now())"));

        let plain = transition_update_sql(None);
        assert!(plain.contains("AND status = $4"));
        assert!(!plain.contains("COALESCE"));
    }

    #[test]
    fn patch_note_distinguishes_absent_from_null() {
        let absent: PatchReservationRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.note, None);

        let cleared: PatchReservationRequest = serde_json::from_str(r#"{"note": null}"#).unwrap();
        assert_eq!(cleared.note, Some(None));

        let replaced: PatchReservationRequest =
            serde_json::from_str(r#"{"note": "walk-in"}"#).unwrap();
        assert_eq!(replaced.note, Some(Some("walk-in".to_string())));
    }
}
