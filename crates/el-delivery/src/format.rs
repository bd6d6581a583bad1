//! Record formatting for alarm-log events
//!
//! Each field is written only if its minimum room is still free in the
//! record budget. A mandatory field that does not fit fails the whole record
//! with [`WireError::FormatTooLong`]; the value is optional and is simply
//! left out when it does not fit.

use el_common::{
    event_time, truncate_chars, RecordBuf, StoredEvent, WireError, DESCRIPTION_WIDTH,
    MAX_RECORD_LENGTH, NAME_WIDTH, STATE_NAME_WIDTH,
};
use el_ring::EventStore;

const ROOM_ID: usize = 15;
const ROOM_APPLICATION: usize = 30;
const ROOM_TYPE: usize = 25;
const ROOM_NAME: usize = 35;
const ROOM_TEXT: usize = 35;
const ROOM_OLD_STATE: usize = 44;
const ROOM_STATE: usize = 34;
const ROOM_OVERWRITES: usize = 41;
const ROOM_LOST: usize = 17;

const APPLICATION_ID: &str = "alarmLog";

#[derive(Debug, Clone)]
pub struct RecordFormatter {
    header: String,
    bitwise_record_types: Vec<String>,
}

impl RecordFormatter {
    pub fn new(header: impl Into<String>, bitwise_record_types: Vec<String>) -> Self {
        Self {
            header: header.into(),
            bitwise_record_types,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Format one drained event. A pending loss count is taken from `store`
    /// and reported only if the record has room for it.
    pub fn format_event(
        &self,
        id: u64,
        stored: &StoredEvent,
        store: &EventStore,
    ) -> Result<String, WireError> {
        let event = &stored.event;
        let source = &event.source;
        let mut buf = RecordBuf::with_prefix(&self.header, MAX_RECORD_LENGTH);

        buf.push_pair("ID", ROOM_ID, id)?;
        buf.push_pair("APPLICATION-ID", ROOM_APPLICATION, APPLICATION_ID)?;
        buf.push(
            "TYPE",
            ROOM_TYPE,
            &format!(
                "TYPE={};EVENTTIME={};",
                event.class.wire_type(),
                event_time(&event.timestamp)
            ),
        )?;
        buf.push_pair("NAME", ROOM_NAME, truncate_chars(&source.name, NAME_WIDTH))?;
        buf.push_pair(
            "TEXT",
            ROOM_TEXT,
            truncate_chars(&source.description, DESCRIPTION_WIDTH).replace(';', ","),
        )?;

        let bitwise = self
            .bitwise_record_types
            .iter()
            .any(|t| *t == source.record_type);
        if let Some(value) = event.value.render(source, bitwise) {
            buf.push_optional("VALUE", &value);
        }

        if event.is_alarm() {
            buf.push(
                "SEVERITY-OLD",
                ROOM_OLD_STATE,
                &format!(
                    "SEVERITY-OLD={};STATUS-OLD={};",
                    state_name(event.old_state.severity.as_str()),
                    state_name(event.old_state.status.as_str())
                ),
            )?;
        }
        buf.push(
            "SEVERITY",
            ROOM_STATE,
            &format!(
                "SEVERITY={};STATUS={};",
                state_name(event.new_state.severity.as_str()),
                state_name(event.new_state.status.as_str())
            ),
        )?;

        if stored.overwrite_count > 0 {
            buf.push(
                "OVERWRITES",
                ROOM_OVERWRITES,
                &format!(
                    "OVERWRITES={};SEVERITY-MAX={};",
                    stored.overwrite_count,
                    state_name(stored.max_severity.as_str())
                ),
            )?;
        }

        if store.lost() > 0 {
            buf.require("LOST", ROOM_LOST)?;
            let lost = store.take_lost();
            if lost > 0 {
                buf.push_pair("LOST", ROOM_LOST, lost)?;
            }
        }

        Ok(buf.into_string())
    }

    /// Stand-in sent when an event cannot be formatted
    pub fn placeholder(&self, id: u64) -> Option<String> {
        let mut buf = RecordBuf::with_prefix(&self.header, MAX_RECORD_LENGTH);
        buf.push(
            "TEXT",
            0,
            &format!("ID={id};TYPE=sysMsg;TEXT=Error - Message too long;"),
        )
        .ok()?;
        Some(buf.into_string())
    }
}

fn state_name(name: &str) -> &str {
    truncate_chars(name, STATE_NAME_WIDTH)
}
