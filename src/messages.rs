/// A single advertisement heard during a scan window.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub address: String,
    pub rssi: i16,
}

impl Observation {
    pub fn new(address: impl Into<String>, rssi: i16) -> Self {
        Observation {
            address: address.into(),
            rssi,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// First time this address has been seen by the tracker.
    New,
    Updated,
    /// Not seen for `max_missing` consecutive cycles. Fires once per absence.
    Expired,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceEvent {
    pub address: String,
    pub kind: EventKind,
    pub smoothed: f64,
}
