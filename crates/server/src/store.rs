use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use proto::Op;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Facilities created on first start when no persisted state exists.
pub const DEFAULT_FACILITIES: [&str; 5] = [
    "Conference_Room_A",
    "Conference_Room_B",
    "Lab_101",
    "Lab_102",
    "Auditorium",
];

// Bookable window: nine one-hour slots from 09:00 to 18:00 local time.
const SLOT_FIRST_HOUR: u32 = 9;
const SLOTS_PER_DAY: u32 = 9;
const SLOT_SECS: u32 = 3600;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("facility not found")]
    UnknownFacility,
    #[error("booking not found")]
    UnknownBooking,
    #[error("interval overlaps an existing booking")]
    Conflict,
    #[error("interval is empty or out of range")]
    InvalidInterval,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Booking {
    #[serde(rename = "booking_id")]
    pub id: u32,
    #[serde(rename = "facility_name")]
    pub facility: String,
    #[serde(rename = "start_time")]
    pub start: u32,
    #[serde(rename = "end_time")]
    pub end: u32,
}

/// Record of a committed mutation, handed to the notification path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingChange {
    pub op: Op,
    pub booking_id: u32,
    pub facility: String,
    pub new_start: u32,
    pub new_end: u32,
    pub old_start: u32,
    pub old_end: u32,
}

/// Plain copy of the store contents, taken under the store lock and handed
/// to the persistence adapter outside it.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub facilities: Vec<(String, Vec<Booking>)>,
}

pub struct BookingStore {
    zone: FixedOffset,
    facilities: HashMap<String, Vec<Booking>>,
    // booking id -> owning facility name
    index: HashMap<u32, String>,
    next_id: u32,
}

fn overlaps(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> bool {
    a_start < b_end && b_start < a_end
}

impl BookingStore {
    pub fn new(zone: FixedOffset) -> Self {
        Self {
            zone,
            facilities: HashMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn from_snapshot(zone: FixedOffset, snapshot: Snapshot) -> Self {
        let mut store = Self::new(zone);
        for (name, bookings) in snapshot.facilities {
            for booking in &bookings {
                store.index.insert(booking.id, name.clone());
                store.next_id = store.next_id.max(booking.id + 1);
            }
            store.facilities.insert(name, bookings);
        }

        store
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut facilities: Vec<_> = self
            .facilities
            .iter()
            .map(|(name, bookings)| (name.clone(), bookings.clone()))
            .collect();
        facilities.sort_by(|(a, _), (b, _)| a.cmp(b));
        Snapshot { facilities }
    }

    /// Creates the default facility set if the store holds none. Returns
    /// whether anything was created.
    pub fn seed_defaults(&mut self) -> bool {
        if !self.facilities.is_empty() {
            return false;
        }

        for name in DEFAULT_FACILITIES {
            self.facilities.insert(name.to_string(), Vec::new());
        }
        true
    }

    pub fn facility_exists(&self, name: &str) -> bool {
        self.facilities.contains_key(name)
    }

    /// Free one-hour slots of `name` for the given day offsets, relative to
    /// `now` in the store's zone. Day offset 0 is the current calendar day.
    /// Slots come back ordered by position in `days`, then by hour.
    pub fn available_slots(
        &self,
        name: &str,
        days: &[u32],
        now: DateTime<Utc>,
    ) -> Result<Vec<(u32, u32)>, StoreError> {
        let bookings = self.facilities.get(name).ok_or(StoreError::UnknownFacility)?;

        let mut slots = Vec::new();
        for &day in days {
            let local = now.with_timezone(&self.zone) + ChronoDuration::days(i64::from(day));
            let date = local.date_naive();
            let window = self
                .zone
                .with_ymd_and_hms(date.year(), date.month(), date.day(), SLOT_FIRST_HOUR, 0, 0)
                .single();
            // Days not representable as u32 epoch seconds are skipped.
            let Some(window_start) = window.and_then(|dt| u32::try_from(dt.timestamp()).ok())
            else {
                continue;
            };

            for hour in 0..SLOTS_PER_DAY {
                let Some(start) = window_start.checked_add(hour * SLOT_SECS) else {
                    break;
                };
                let Some(end) = start.checked_add(SLOT_SECS) else {
                    break;
                };

                let free = bookings.iter().all(|b| !overlaps(start, end, b.start, b.end));
                if free {
                    slots.push((start, end));
                }
            }
        }

        Ok(slots)
    }

    pub fn create_booking(
        &mut self,
        name: &str,
        start: u32,
        end: u32,
    ) -> Result<BookingChange, StoreError> {
        let bookings = self
            .facilities
            .get_mut(name)
            .ok_or(StoreError::UnknownFacility)?;

        if start >= end {
            return Err(StoreError::InvalidInterval);
        }
        if bookings.iter().any(|b| overlaps(start, end, b.start, b.end)) {
            return Err(StoreError::Conflict);
        }

        let id = self.next_id;
        self.next_id += 1;

        bookings.push(Booking {
            id,
            facility: name.to_string(),
            start,
            end,
        });
        self.index.insert(id, name.to_string());

        Ok(BookingChange {
            op: Op::Book,
            booking_id: id,
            facility: name.to_string(),
            new_start: start,
            new_end: end,
            old_start: 0,
            old_end: 0,
        })
    }

    /// Shifts both endpoints of a booking by `offset_minutes`. The booking's
    /// own interval is excluded from the conflict check.
    pub fn change_booking(
        &mut self,
        booking_id: u32,
        offset_minutes: i32,
    ) -> Result<BookingChange, StoreError> {
        let facility = self
            .index
            .get(&booking_id)
            .ok_or(StoreError::UnknownBooking)?
            .clone();
        let bookings = self.facilities.get_mut(&facility).expect("index in sync");
        let current = bookings
            .iter()
            .find(|b| b.id == booking_id)
            .expect("index in sync");

        let delta = i64::from(offset_minutes) * 60;
        let new_start = u32::try_from(i64::from(current.start) + delta)
            .map_err(|_| StoreError::InvalidInterval)?;
        let new_end = u32::try_from(i64::from(current.end) + delta)
            .map_err(|_| StoreError::InvalidInterval)?;
        if new_start >= new_end {
            return Err(StoreError::InvalidInterval);
        }

        if bookings
            .iter()
            .any(|b| b.id != booking_id && overlaps(new_start, new_end, b.start, b.end))
        {
            return Err(StoreError::Conflict);
        }

        let booking = bookings
            .iter_mut()
            .find(|b| b.id == booking_id)
            .expect("index in sync");
        let change = BookingChange {
            op: Op::Change,
            booking_id,
            facility,
            new_start,
            new_end,
            old_start: booking.start,
            old_end: booking.end,
        };
        booking.start = new_start;
        booking.end = new_end;

        Ok(change)
    }

    /// Extends only the end of a booking. Zero minutes is a successful no-op.
    pub fn extend_booking(
        &mut self,
        booking_id: u32,
        minutes: u32,
    ) -> Result<BookingChange, StoreError> {
        let facility = self
            .index
            .get(&booking_id)
            .ok_or(StoreError::UnknownBooking)?
            .clone();
        let bookings = self.facilities.get_mut(&facility).expect("index in sync");
        let current = bookings
            .iter()
            .find(|b| b.id == booking_id)
            .expect("index in sync");

        let new_end = u32::try_from(i64::from(current.end) + i64::from(minutes) * 60)
            .map_err(|_| StoreError::InvalidInterval)?;
        let (start, old_end) = (current.start, current.end);

        if bookings
            .iter()
            .any(|b| b.id != booking_id && overlaps(start, new_end, b.start, b.end))
        {
            return Err(StoreError::Conflict);
        }

        let booking = bookings
            .iter_mut()
            .find(|b| b.id == booking_id)
            .expect("index in sync");
        booking.end = new_end;

        Ok(BookingChange {
            op: Op::Extend,
            booking_id,
            facility,
            new_start: start,
            new_end,
            old_start: start,
            old_end,
        })
    }

    /// Latest end time over all bookings of a facility, 0 when it has none.
    pub fn last_booking_end(&self, name: &str) -> Result<u32, StoreError> {
        let bookings = self.facilities.get(name).ok_or(StoreError::UnknownFacility)?;
        Ok(bookings.iter().map(|b| b.end).max().unwrap_or(0))
    }
}
