use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub session_ttl_hours: i64,
    pub slot_minutes: i32,
    pub open_minute: i32,
    pub close_minute: i32,
}

/* -------------------------
   Reservation status machine
--------------------------*/

/// Stored as smallint in reservation.status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Booked = 0,
    Confirmed = 1,
    Arrived = 2,
    InService = 3,
    Done = 4,
    Cancelled = 5,
    NoShow = 6,
}

impl ReservationStatus {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Booked),
            1 => Some(Self::Confirmed),
            2 => Some(Self::Arrived),
            3 => Some(Self::InService),
            4 => Some(Self::Done),
            5 => Some(Self::Cancelled),
            6 => Some(Self::NoShow),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Terminal reservations no longer block the grid and cannot move again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::NoShow)
    }

    /// Still occupies its time slot for conflict purposes.
    pub fn blocks_slot(self) -> bool {
        !matches!(self, Self::Cancelled | Self::NoShow)
    }

    pub fn can_transition(self, next: Self) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Booked, Confirmed)
                | (Booked, Arrived)
                | (Confirmed, Arrived)
                | (Arrived, InService)
                | (InService, Done)
                | (Booked, Cancelled)
                | (Confirmed, Cancelled)
                | (Arrived, Cancelled)
                | (Booked, NoShow)
                | (Confirmed, NoShow)
        )
    }
}

/* -------------------------
   Shared API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, sqlx::FromRow)]
pub struct SessionLookupRow {
    pub session_token_id: Uuid,
    pub user_id: Uuid,
    pub clinic_id: Uuid,
    pub role: i16,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MenuRow {
    pub menu_id: Uuid,
    pub clinic_id: Uuid,
    pub display_name: String,
    pub duration_minutes: i32,
    pub price_cents: i32,
    pub display_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MenuOptionRow {
    pub option_id: Uuid,
    pub menu_id: Uuid,
    pub display_name: String,
    pub duration_delta_minutes: i32,
    pub price_delta_cents: i32,
    pub display_order: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ResourceRow {
    pub resource_id: Uuid,
    pub clinic_id: Uuid,
    pub kind: i16,
    pub display_name: String,
    pub display_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SecurityEventRow {
    pub event_id: Uuid,
    pub clinic_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/* -------------------------
   Helpers
--------------------------*/

/// Role mapping (app_user.role smallint):
/// 1 admin, 2 manager, 3 staff, 4 receptionist
pub fn role_to_string(role: i16) -> String {
    match role {
        1 => "admin",
        2 => "manager",
        3 => "staff",
        4 => "receptionist",
        _ => "unknown",
    }
    .to_string()
}

/// Resource kind mapping (resource.kind smallint):
/// 0 staff member, 1 room
pub const RESOURCE_KIND_STAFF: i16 = 0;
pub const RESOURCE_KIND_ROOM: i16 = 1;

#[cfg(test)]
mod tests {
    use super::ReservationStatus::*;
    use super::*;

    #[test]
    fn status_roundtrip() {
        for v in 0..=6i16 {
            let s = ReservationStatus::from_i16(v).unwrap();
            assert_eq!(s.as_i16(), v);
        }
        assert!(ReservationStatus::from_i16(7).is_none());
        assert!(ReservationStatus::from_i16(-1).is_none());
    }

    #[test]
    fn happy_path_transitions() {
        assert!(Booked.can_transition(Confirmed));
        assert!(Confirmed.can_transition(Arrived));
        assert!(Arrived.can_transition(InService));
        assert!(InService.can_transition(Done));
    }

    #[test]
    fn walk_in_skips_confirmation() {
        assert!(Booked.can_transition(Arrived));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for from in [Done, Cancelled, NoShow] {
            assert!(from.is_terminal());
            for to in [Booked, Confirmed, Arrived, InService, Done, Cancelled, NoShow] {
                assert!(!from.can_transition(to));
            }
        }
    }

    #[test]
    fn no_show_only_before_arrival() {
        assert!(Booked.can_transition(NoShow));
        assert!(Confirmed.can_transition(NoShow));
        assert!(!Arrived.can_transition(NoShow));
        assert!(!InService.can_transition(NoShow));
    }

    #[test]
    fn cancel_not_allowed_mid_service() {
        assert!(Arrived.can_transition(Cancelled));
        assert!(!InService.can_transition(Cancelled));
    }

    #[test]
    fn cancelled_and_no_show_release_the_slot() {
        assert!(!Cancelled.blocks_slot());
        assert!(!NoShow.blocks_slot());
        assert!(Done.blocks_slot());
        assert!(Booked.blocks_slot());
    }
}
