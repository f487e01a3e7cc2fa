use crate::monitor::MonitorRegistry;
use crate::persist::Storage;
use crate::store::{BookingChange, BookingStore, StoreError};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use proto::{
    error_response, response_head, DecodeError, Notification, Op, Reader, Request, RequestHeader,
    Writer, STATUS_SUCCESS,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transport::Endpoint;

/// Day offsets included in every notification's availability listing.
const NOTIFY_DAYS: [u32; 7] = [0, 1, 2, 3, 4, 5, 6];

/// Decodes request datagrams, runs them against the booking store and the
/// monitor registry, and produces response datagrams. Every error that can
/// occur past the envelope header turns into an ERROR response here; nothing
/// propagates to the socket loop.
pub struct Dispatcher {
    store: RwLock<BookingStore>,
    monitors: Mutex<MonitorRegistry>,
    storage: Option<Box<dyn Storage>>,
    // serializes saves so a slow write cannot publish stale state over a
    // newer one
    save_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(store: BookingStore, storage: Option<Box<dyn Storage>>) -> Self {
        Self {
            store: RwLock::new(store),
            monitors: Mutex::new(MonitorRegistry::new()),
            storage,
            save_lock: Mutex::new(()),
        }
    }

    /// Handles one request datagram. Returns the response to send plus the
    /// committed mutation, if any, for the notification path. `None` means
    /// the datagram was too short to carry an envelope and is dropped.
    pub fn process(
        &self,
        packet: &[u8],
        peer: SocketAddr,
    ) -> Option<(Vec<u8>, Option<BookingChange>)> {
        let mut r = Reader::new(packet);
        let header = match RequestHeader::decode(&mut r) {
            Ok(header) => header,
            Err(err) => {
                debug!(%peer, %err, "dropping datagram without a valid envelope");
                return None;
            }
        };

        let request = match Request::decode_payload(header.message_type, &mut r) {
            Ok(request) => request,
            Err(DecodeError::UnknownMessageType(kind)) => {
                warn!(%peer, kind, "unknown message type");
                return Some((
                    error_response(header.request_id, "Unknown message type"),
                    None,
                ));
            }
            Err(err) => {
                debug!(%peer, %err, "undecodable payload");
                return Some((
                    error_response(header.request_id, &format!("Server error: {err}")),
                    None,
                ));
            }
        };

        debug!(%peer, request_id = header.request_id, kind = header.message_type, "processing request");

        let (response, change) = self.execute(header.request_id, request, peer);
        if change.is_some() {
            self.persist();
        }

        Some((response, change))
    }

    fn execute(
        &self,
        request_id: u32,
        request: Request,
        peer: SocketAddr,
    ) -> (Vec<u8>, Option<BookingChange>) {
        match request {
            Request::QueryAvailability { facility, days } => {
                let slots = self
                    .store
                    .read()
                    .available_slots(&facility, &days, Utc::now());
                match slots {
                    Ok(slots) => {
                        let mut w = response_head(request_id, STATUS_SUCCESS);
                        put_slots(&mut w, &slots);
                        (w.into_bytes(), None)
                    }
                    Err(_) => (error_response(request_id, "Facility not found"), None),
                }
            }

            Request::Book {
                facility,
                start,
                end,
            } => match self.store.write().create_booking(&facility, start, end) {
                Ok(change) => {
                    info!(booking_id = change.booking_id, %facility, "created booking");
                    let mut w = response_head(request_id, STATUS_SUCCESS);
                    w.put_u32(change.booking_id);
                    (w.into_bytes(), Some(change))
                }
                Err(StoreError::UnknownFacility) => {
                    (error_response(request_id, "Facility not found"), None)
                }
                Err(_) => (error_response(request_id, "Time slot not available"), None),
            },

            Request::Change {
                booking_id,
                offset_minutes,
            } => match self.store.write().change_booking(booking_id, offset_minutes) {
                Ok(change) => {
                    info!(booking_id, offset_minutes, "changed booking");
                    let mut w = response_head(request_id, STATUS_SUCCESS);
                    w.put_str("Booking updated successfully");
                    (w.into_bytes(), Some(change))
                }
                Err(_) => (error_response(request_id, "Cannot change booking"), None),
            },

            Request::Monitor {
                facility,
                duration_secs,
            } => {
                if !self.store.read().facility_exists(&facility) {
                    return (error_response(request_id, "Facility not found"), None);
                }

                self.monitors.lock().register(
                    &facility,
                    peer,
                    Duration::from_secs(u64::from(duration_secs)),
                    Instant::now(),
                );
                info!(%peer, %facility, duration_secs, "registered monitor");

                let mut w = response_head(request_id, STATUS_SUCCESS);
                w.put_str("Monitoring registered successfully");
                (w.into_bytes(), None)
            }

            Request::LastBookingEnd { facility } => {
                match self.store.read().last_booking_end(&facility) {
                    Ok(last_end) => {
                        let mut w = response_head(request_id, STATUS_SUCCESS);
                        w.put_u32(last_end);
                        w.put_str(if last_end == 0 {
                            "No bookings found"
                        } else {
                            "Last booking end time retrieved"
                        });
                        (w.into_bytes(), None)
                    }
                    Err(_) => (error_response(request_id, "Facility not found"), None),
                }
            }

            Request::Extend {
                booking_id,
                minutes,
            } => match self.store.write().extend_booking(booking_id, minutes) {
                Ok(change) => {
                    info!(booking_id, minutes, "extended booking");
                    let mut w = response_head(request_id, STATUS_SUCCESS);
                    w.put_u32(change.new_end);
                    w.put_str("Booking extended successfully");
                    (w.into_bytes(), Some(change))
                }
                Err(_) => (error_response(request_id, "Cannot extend booking"), None),
            },
        }
    }

    /// Pushes one notification datagram to every live subscriber of the
    /// changed facility. Runs after the response for the triggering request
    /// has been sent. Send failures are logged and the subscriber kept; the
    /// client's own monitor deadline bounds how long it stays around.
    pub fn notify(&self, change: &BookingChange, socket: &Endpoint) {
        let slots = self
            .store
            .read()
            .available_slots(&change.facility, &NOTIFY_DAYS, Utc::now())
            .unwrap_or_default();

        let message = match change.op {
            Op::Book => format!("New booking created for {}", change.facility),
            Op::Change => format!("Booking time changed for {}", change.facility),
            Op::Extend => format!("Booking extended for {}", change.facility),
        };

        let bytes = Notification {
            message,
            op: change.op,
            booking_id: change.booking_id,
            new_start: change.new_start,
            new_end: change.new_end,
            old_start: change.old_start,
            old_end: change.old_end,
            slots,
        }
        .encode();

        let peers = self
            .monitors
            .lock()
            .subscribers(&change.facility, Instant::now());
        if peers.is_empty() {
            return;
        }

        let mut sent = 0usize;
        for peer in &peers {
            match socket.send(&bytes, *peer) {
                Ok(()) => sent += 1,
                Err(err) => warn!(%peer, %err, "failed to send notification"),
            }
        }
        info!(
            facility = %change.facility,
            op = change.op.code(),
            sent,
            "notified monitoring clients"
        );
    }

    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };

        let _guard = self.save_lock.lock();
        let snapshot = self.store.read().snapshot();
        if let Err(err) = storage.save(&snapshot) {
            warn!(%err, "failed to persist bookings, in-memory state stays authoritative");
        }
    }

    /// Saves the current state once at startup, after default facilities
    /// were seeded.
    pub fn persist_initial(&self) {
        self.persist();
    }
}

fn put_slots(w: &mut Writer, slots: &[(u32, u32)]) {
    w.put_u16(slots.len() as u16);
    for (start, end) in slots {
        w.put_u32(*start);
        w.put_u32(*end);
    }
}
