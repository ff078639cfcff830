//! # Data Model
//!
//! Entity identifiers, millisecond timestamps and the records kept in the
//! sharded tables: users with their natural-key indexes, posts and replies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Generated entity identifier.
///
/// Produced by [`crate::idgen::IdGenerator`]; ordered by creation time and never
/// negative for generated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl EntityId {
    /// Synthetic "newer than everything" identifier used by an empty cursor.
    pub const MAX: EntityId = EntityId(i64::MAX);

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(EntityId(i64::from_be_bytes(raw)))
    }

    /// Zero-padded 19 digit rendering; lexicographic order equals numeric order.
    pub fn to_fixed_width(self) -> String {
        format!("{:019}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(EntityId)
    }
}

/// UTC milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Millis(pub i64);

impl Millis {
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Truncates to millisecond precision.
    pub fn from_datetime(datetime: OffsetDateTime) -> Self {
        Millis((datetime.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    pub fn to_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128 * 1_000_000).ok()
    }

    /// Big-endian bytes with the sign bit flipped, so byte order matches numeric order.
    pub fn to_sortable_bytes(self) -> [u8; 8] {
        ((self.0 as u64) ^ (1 << 63)).to_be_bytes()
    }

    pub fn from_sortable_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(Millis((u64::from_be_bytes(raw) ^ (1 << 63)) as i64))
    }
}

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Unique external identifiers that map to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NaturalKeyKind {
    Email,
    Phone,
    Nickname,
}

impl NaturalKeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NaturalKeyKind::Email => "email",
            NaturalKeyKind::Phone => "phone",
            NaturalKeyKind::Nickname => "nickname",
        }
    }
}

impl fmt::Display for NaturalKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary user row, sharded by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: EntityId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub nickname: String,
    /// Opaque credential digest produced by the caller.
    pub password_hash: String,
    pub created_at: Millis,
}

impl User {
    /// Natural keys claimed by this user, in claim order.
    pub fn natural_keys(&self) -> Vec<(NaturalKeyKind, &str)> {
        let mut keys = vec![(NaturalKeyKind::Nickname, self.nickname.as_str())];
        if let Some(phone) = self.phone.as_deref() {
            keys.push((NaturalKeyKind::Phone, phone));
        }
        if let Some(email) = self.email.as_deref() {
            keys.push((NaturalKeyKind::Email, email));
        }
        keys
    }
}

/// Orderings available for post listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOrder {
    CreatedAt,
    ReplyTime,
}

impl PostOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            PostOrder::CreatedAt => "created_at",
            PostOrder::ReplyTime => "reply_time",
        }
    }
}

impl fmt::Display for PostOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" | "create_time" => Ok(PostOrder::CreatedAt),
            "reply_time" => Ok(PostOrder::ReplyTime),
            other => Err(format!("unsupported post order: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: EntityId,
    pub author_id: EntityId,
    pub title: String,
    pub content: String,
    pub created_at: Millis,
    /// Time of the latest reply, or `created_at` for a post without replies.
    pub reply_time: Millis,
    pub reply_num: i64,
}

impl Post {
    pub fn order_time(&self, order: PostOrder) -> Millis {
        match order {
            PostOrder::CreatedAt => self.created_at,
            PostOrder::ReplyTime => self.reply_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub reply_id: EntityId,
    pub post_id: EntityId,
    pub author_id: EntityId,
    pub content: String,
    pub created_at: Millis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sortable_millis_bytes_preserve_order() {
        let values = [i64::MIN, -5, -1, 0, 1, 1_700_000_000_000, i64::MAX];
        for pair in values.windows(2) {
            let left = Millis(pair[0]).to_sortable_bytes();
            let right = Millis(pair[1]).to_sortable_bytes();
            assert!(left < right, "{:?} should sort before {:?}", pair[0], pair[1]);
        }
        let round = Millis::from_sortable_bytes(&Millis(-42).to_sortable_bytes()).unwrap();
        assert_eq!(round, Millis(-42));
    }

    #[test]
    fn fixed_width_ids_sort_numerically() {
        let small = EntityId(9).to_fixed_width();
        let large = EntityId(10).to_fixed_width();
        assert_eq!(small.len(), 19);
        assert!(small < large);
        assert_eq!(EntityId::MAX.to_fixed_width().len(), 19);
    }

    #[test]
    fn post_order_accepts_legacy_name() {
        assert_eq!("create_time".parse::<PostOrder>(), Ok(PostOrder::CreatedAt));
        assert_eq!("reply_time".parse::<PostOrder>(), Ok(PostOrder::ReplyTime));
        assert!("hot".parse::<PostOrder>().is_err());
    }

    #[test]
    fn user_natural_keys_follow_claim_order() {
        let user = User {
            user_id: EntityId(7),
            email: Some("a@b.com".to_string()),
            phone: None,
            nickname: "alice".to_string(),
            password_hash: String::new(),
            created_at: Millis(0),
        };
        let kinds: Vec<_> = user.natural_keys().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![NaturalKeyKind::Nickname, NaturalKeyKind::Email]);
    }
}
