use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);

/// Separator between the two user ids of a direct room, e.g. `"1_2"`.
pub const DIRECT_ROOM_SEPARATOR: char = '_';

/// Broadcast scope for messages: a persisted group or a synthetic direct pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    Group(GroupId),
    Direct(UserId, UserId),
}

impl RoomId {
    /// Direct room between two users. The same pair always yields the same room
    /// regardless of argument order.
    pub fn direct(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Direct(a, b)
        } else {
            Self::Direct(b, a)
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(..))
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::Group(id) => Some(*id),
            Self::Direct(..) => None,
        }
    }

    /// Members encoded in the identifier itself. Group rooms have none.
    pub fn direct_members(&self) -> Option<(UserId, UserId)> {
        match self {
            Self::Direct(a, b) => Some((*a, *b)),
            Self::Group(_) => None,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(id) => write!(f, "{}", id.0),
            Self::Direct(a, b) => write!(f, "{}{}{}", a.0, DIRECT_ROOM_SEPARATOR, b.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room id: {0:?}")]
pub struct InvalidRoomId(pub String);

impl FromStr for RoomId {
    type Err = InvalidRoomId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let invalid = || InvalidRoomId(raw.to_string());

        if let Some((first, second)) = trimmed.split_once(DIRECT_ROOM_SEPARATOR) {
            let a = first.parse::<i64>().map_err(|_| invalid())?;
            let b = second.parse::<i64>().map_err(|_| invalid())?;
            return Ok(Self::direct(UserId(a), UserId(b)));
        }

        trimmed
            .parse::<i64>()
            .map(|id| Self::Group(GroupId(id)))
            .map_err(|_| invalid())
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Clients send group rooms as bare numbers and direct rooms as strings.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(Self::Group(GroupId(id))),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Delivery status of a message. Ordering follows the lifecycle, so a status
/// may only be replaced by a greater one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }

    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        next > *self
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub group_name: String,
    pub admin_id: UserId,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
