use crate::wire::{DecodeError, Reader, Writer};

pub const STATUS_SUCCESS: u8 = 100;
pub const STATUS_ERROR: u8 = 101;

/// Request id carried by server-initiated notification datagrams.
pub const NOTIFY_REQUEST_ID: u32 = 0;

pub const MSG_QUERY_AVAILABILITY: u8 = 1;
pub const MSG_BOOK_FACILITY: u8 = 2;
pub const MSG_CHANGE_BOOKING: u8 = 3;
pub const MSG_MONITOR_FACILITY: u8 = 4;
pub const MSG_GET_LAST_BOOKING_TIME: u8 = 5;
pub const MSG_EXTEND_BOOKING: u8 = 6;

/// Mutation kind carried inside notification payloads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Op {
    Book = 1,
    Change = 2,
    Extend = 3,
}

impl Op {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(Op::Book),
            2 => Ok(Op::Change),
            3 => Ok(Op::Extend),
            other => Err(DecodeError::UnknownOperation(other)),
        }
    }

    /// Whether notifications for this operation carry the previous interval.
    pub fn carries_old_interval(self) -> bool {
        matches!(self, Op::Change | Op::Extend)
    }
}

/// Envelope prefix common to every client request:
/// `request_id:u32, message_type:u8, payload_len:u16`.
#[derive(Clone, Copy, Debug)]
pub struct RequestHeader {
    pub request_id: u32,
    pub message_type: u8,
}

impl RequestHeader {
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let request_id = r.get_u32()?;
        let message_type = r.get_u8()?;
        // The declared payload length is redundant on a datagram transport.
        // It stays on the wire for compatibility with existing clients.
        let _payload_len = r.get_u16()?;
        Ok(Self {
            request_id,
            message_type,
        })
    }
}

/// Reads the request id off the front of a raw datagram without decoding the
/// rest. The at-most-once cache probe runs before any real parsing.
pub fn peek_request_id(buf: &[u8]) -> Option<u32> {
    Reader::new(buf).get_u32().ok()
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Request {
    QueryAvailability { facility: String, days: Vec<u32> },
    Book { facility: String, start: u32, end: u32 },
    Change { booking_id: u32, offset_minutes: i32 },
    Monitor { facility: String, duration_secs: u32 },
    LastBookingEnd { facility: String },
    Extend { booking_id: u32, minutes: u32 },
}

impl Request {
    pub fn message_type(&self) -> u8 {
        match self {
            Request::QueryAvailability { .. } => MSG_QUERY_AVAILABILITY,
            Request::Book { .. } => MSG_BOOK_FACILITY,
            Request::Change { .. } => MSG_CHANGE_BOOKING,
            Request::Monitor { .. } => MSG_MONITOR_FACILITY,
            Request::LastBookingEnd { .. } => MSG_GET_LAST_BOOKING_TIME,
            Request::Extend { .. } => MSG_EXTEND_BOOKING,
        }
    }

    fn encode_payload(&self, w: &mut Writer) {
        match self {
            Request::QueryAvailability { facility, days } => {
                w.put_str(facility);
                w.put_u16(days.len() as u16);
                for day in days {
                    w.put_u32(*day);
                }
            }
            Request::Book {
                facility,
                start,
                end,
            } => {
                w.put_str(facility);
                w.put_u32(*start);
                w.put_u32(*end);
            }
            Request::Change {
                booking_id,
                offset_minutes,
            } => {
                w.put_u32(*booking_id);
                w.put_i32(*offset_minutes);
            }
            Request::Monitor {
                facility,
                duration_secs,
            } => {
                w.put_str(facility);
                w.put_u32(*duration_secs);
            }
            Request::LastBookingEnd { facility } => {
                w.put_str(facility);
            }
            Request::Extend {
                booking_id,
                minutes,
            } => {
                w.put_u32(*booking_id);
                w.put_u32(*minutes);
            }
        }
    }

    /// Encodes the full request datagram, envelope included.
    pub fn encode(&self, request_id: u32) -> Vec<u8> {
        let mut payload = Writer::new();
        self.encode_payload(&mut payload);

        let mut w = Writer::new();
        w.put_u32(request_id);
        w.put_u8(self.message_type());
        w.put_u16(payload.len() as u16);
        w.put_bytes(payload.as_slice());
        w.into_bytes()
    }

    /// Decodes a request payload positioned right after the envelope header.
    pub fn decode_payload(message_type: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match message_type {
            MSG_QUERY_AVAILABILITY => {
                let facility = r.get_str()?;
                let day_count = r.get_u16()?;
                let mut days = Vec::with_capacity(day_count as usize);
                for _ in 0..day_count {
                    days.push(r.get_u32()?);
                }
                Ok(Request::QueryAvailability { facility, days })
            }
            MSG_BOOK_FACILITY => Ok(Request::Book {
                facility: r.get_str()?,
                start: r.get_u32()?,
                end: r.get_u32()?,
            }),
            MSG_CHANGE_BOOKING => Ok(Request::Change {
                booking_id: r.get_u32()?,
                offset_minutes: r.get_i32()?,
            }),
            MSG_MONITOR_FACILITY => Ok(Request::Monitor {
                facility: r.get_str()?,
                duration_secs: r.get_u32()?,
            }),
            MSG_GET_LAST_BOOKING_TIME => Ok(Request::LastBookingEnd {
                facility: r.get_str()?,
            }),
            MSG_EXTEND_BOOKING => Ok(Request::Extend {
                booking_id: r.get_u32()?,
                minutes: r.get_u32()?,
            }),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// Starts a response datagram: `request_id:u32, status:u8`, body follows.
pub fn response_head(request_id: u32, status: u8) -> Writer {
    let mut w = Writer::new();
    w.put_u32(request_id);
    w.put_u8(status);
    w
}

pub fn error_response(request_id: u32, message: &str) -> Vec<u8> {
    let mut w = response_head(request_id, STATUS_ERROR);
    w.put_str(message);
    w.into_bytes()
}

/// Server-initiated push sent to monitor subscribers after a mutation.
///
/// Layout: `request_id=0, status, message:str, op:u8, booking_id:u32,
/// new_start:u32, new_end:u32, [old_start:u32, old_end:u32], slot_count:u16,
/// (start:u32, end:u32)*`. The old interval is present only for change and
/// extend operations; the slot list is the facility's availability over the
/// next seven days.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Notification {
    pub message: String,
    pub op: Op,
    pub booking_id: u32,
    pub new_start: u32,
    pub new_end: u32,
    pub old_start: u32,
    pub old_end: u32,
    pub slots: Vec<(u32, u32)>,
}

impl Notification {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = response_head(NOTIFY_REQUEST_ID, STATUS_SUCCESS);
        w.put_str(&self.message);
        w.put_u8(self.op.code());
        w.put_u32(self.booking_id);
        w.put_u32(self.new_start);
        w.put_u32(self.new_end);
        if self.op.carries_old_interval() {
            w.put_u32(self.old_start);
            w.put_u32(self.old_end);
        }
        w.put_u16(self.slots.len() as u16);
        for (start, end) in &self.slots {
            w.put_u32(*start);
            w.put_u32(*end);
        }
        w.into_bytes()
    }

    /// Decodes a full notification datagram, envelope included.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let _request_id = r.get_u32()?;
        let _status = r.get_u8()?;
        let message = r.get_str()?;
        let op = Op::from_code(r.get_u8()?)?;
        let booking_id = r.get_u32()?;
        let new_start = r.get_u32()?;
        let new_end = r.get_u32()?;
        let (old_start, old_end) = if op.carries_old_interval() {
            (r.get_u32()?, r.get_u32()?)
        } else {
            (0, 0)
        };
        let slot_count = r.get_u16()?;
        let mut slots = Vec::with_capacity(slot_count as usize);
        for _ in 0..slot_count {
            slots.push((r.get_u32()?, r.get_u32()?));
        }
        Ok(Self {
            message,
            op,
            booking_id,
            new_start,
            new_end,
            old_start,
            old_end,
            slots,
        })
    }

    /// Whether a raw datagram looks like a notification rather than a reply
    /// to an outstanding request.
    pub fn matches(buf: &[u8]) -> bool {
        peek_request_id(buf) == Some(NOTIFY_REQUEST_ID)
    }
}
