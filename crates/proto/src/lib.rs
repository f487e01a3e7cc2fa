mod message;
mod wire;

pub use message::{
    error_response, peek_request_id, response_head, Notification, Op, Request, RequestHeader,
    MSG_BOOK_FACILITY, MSG_CHANGE_BOOKING, MSG_EXTEND_BOOKING, MSG_GET_LAST_BOOKING_TIME,
    MSG_MONITOR_FACILITY, MSG_QUERY_AVAILABILITY, NOTIFY_REQUEST_ID, STATUS_ERROR, STATUS_SUCCESS,
};
pub use wire::{DecodeError, Reader, Writer};

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;
