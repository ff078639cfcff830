//! # Page Cursors
//!
//! A cursor is the `(order_time, entity_id)` of the last item on a page,
//! rendered as `YYYY-MM-DD-HH-MM-SS.mmm_ID` (UTC). Every character in that
//! alphabet is legal in a URL path, so the token needs no escaping; a
//! percent-encoded copy is still accepted on decode.

use crate::error::{ForumError, ForumResult};
use crate::model::{EntityId, Millis};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

const CURSOR_TIME_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]-[hour]-[minute]-[second].[subsecond digits:3]"
);

/// 0000-01-01T00:00:00.000Z
const MIN_CURSOR_MILLIS: i64 = -62_167_219_200_000;
/// 9999-12-31T23:59:59.999Z
const MAX_CURSOR_MILLIS: i64 = 253_402_300_799_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub entity_id: EntityId,
    pub order_time: Millis,
}

impl PageCursor {
    pub fn new(entity_id: EntityId, order_time: Millis) -> Self {
        Self {
            entity_id,
            order_time,
        }
    }

    /// Position before the newest possible item.
    pub fn start() -> Self {
        Self::new(EntityId::MAX, Millis::now())
    }

    /// Times outside years 0000..=9999 are clamped to that range.
    pub fn encode(&self) -> String {
        let millis = Millis(self.order_time.0.clamp(MIN_CURSOR_MILLIS, MAX_CURSOR_MILLIS));
        let time = millis
            .to_datetime()
            .and_then(|datetime| datetime.format(CURSOR_TIME_FORMAT).ok())
            .unwrap_or_default();
        format!("{}_{}", time, self.entity_id)
    }

    /// An empty cursor means "start from the newest item".
    pub fn decode(cursor: &str) -> ForumResult<Self> {
        if cursor.is_empty() {
            return Ok(Self::start());
        }
        let invalid = |reason: String| ForumError::InvalidCursor {
            cursor: cursor.to_string(),
            reason,
        };
        let raw = percent_decode(cursor).ok_or_else(|| invalid("bad percent escape".into()))?;
        let (time, id) = raw
            .rsplit_once('_')
            .ok_or_else(|| invalid("missing '_' separator".into()))?;
        let entity_id = id
            .parse::<EntityId>()
            .map_err(|err| invalid(format!("entity id: {err}")))?;
        if entity_id.0 < 0 {
            return Err(invalid("negative entity id".into()));
        }
        let datetime = PrimitiveDateTime::parse(time, CURSOR_TIME_FORMAT)
            .map_err(|err| invalid(format!("time: {err}")))?;
        Ok(Self::new(
            entity_id,
            Millis::from_datetime(datetime.assume_utc()),
        ))
    }
}

fn percent_decode(input: &str) -> Option<String> {
    if !input.contains('%') {
        return Some(input.to_string());
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
