//! Wire-level data model of the Bot API subset the runtime consumes.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Chat identifier: either the numeric id or a public `@name` handle.
///
/// Comparisons treat handles case-insensitively and ignore the leading `@`.
/// Numeric ids sort after handles; that ordering is an internal tie-break,
/// not something the Bot API guarantees.
#[derive(Debug, Clone)]
pub enum ChatId {
    Id(i64),
    Username(String),
}

impl ChatId {
    fn canonical(name: &str) -> String {
        name.strip_prefix('@').unwrap_or(name).to_lowercase()
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        ChatId::Id(id)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(id) => ChatId::Id(id),
            Err(_) => ChatId::Username(s.to_string()),
        }
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        match s.parse::<i64>() {
            Ok(id) => ChatId::Id(id),
            Err(_) => ChatId::Username(s),
        }
    }
}

impl FromStr for ChatId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatId::Id(id) => write!(f, "{id}"),
            ChatId::Username(name) if name.starts_with('@') => f.write_str(name),
            ChatId::Username(name) => write!(f, "@{name}"),
        }
    }
}

impl PartialEq for ChatId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ChatId::Id(a), ChatId::Id(b)) => a == b,
            (ChatId::Username(a), ChatId::Username(b)) => {
                Self::canonical(a) == Self::canonical(b)
            }
            _ => false,
        }
    }
}

impl Eq for ChatId {}

impl Hash for ChatId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ChatId::Id(id) => {
                0u8.hash(state);
                id.hash(state);
            }
            ChatId::Username(name) => {
                1u8.hash(state);
                Self::canonical(name).hash(state);
            }
        }
    }
}

impl Ord for ChatId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChatId::Id(a), ChatId::Id(b)) => a.cmp(b),
            (ChatId::Username(a), ChatId::Username(b)) => {
                Self::canonical(a).cmp(&Self::canonical(b))
            }
            (ChatId::Id(_), ChatId::Username(_)) => Ordering::Greater,
            (ChatId::Username(_), ChatId::Id(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for ChatId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ChatId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ChatId::Id(id) => serializer.serialize_i64(*id),
            ChatId::Username(_) => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for ChatId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChatIdVisitor;

        impl Visitor<'_> for ChatIdVisitor {
            type Value = ChatId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer chat id or a @username string")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ChatId, E> {
                Ok(ChatId::Id(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ChatId, E> {
                i64::try_from(v)
                    .map(ChatId::Id)
                    .map_err(|_| E::custom("chat id out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ChatId, E> {
                Ok(v.into())
            }
        }

        deserializer.deserialize_any(ChatIdVisitor)
    }
}

/// `date`-style fields are Unix seconds on the wire. Values whose magnitude
/// cannot be seconds are read as milliseconds.
pub(crate) mod unix_time {
    use serde::{Deserialize, Deserializer, Serializer};

    const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

    pub(crate) fn from_wire(value: i64) -> i64 {
        if value.abs() >= MILLIS_THRESHOLD {
            value / 1000
        } else {
            value
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        i64::deserialize(d).map(from_wire)
    }

    pub(crate) fn serialize<S: Serializer>(value: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(*value)
    }

    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<i64>, D::Error> {
            Ok(Option::<i64>::deserialize(d)?.map(super::from_wire))
        }

        pub(crate) fn serialize<S: Serializer>(
            value: &Option<i64>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            value.serialize(s)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
}

/// Entity kinds of Bot API 7.x. The list is closed on the wire; new kinds
/// would fail decoding loudly rather than being silently misfiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Mention,
    Hashtag,
    Cashtag,
    BotCommand,
    Url,
    Email,
    PhoneNumber,
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Spoiler,
    Code,
    Pre,
    TextLink,
    TextMention,
    CustomEmoji,
    Blockquote,
    ExpandableBlockquote,
}

/// A span inside message text. `offset` and `length` count UTF-16 code
/// units, not bytes and not scalar values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(with = "unix_time")]
    pub date: i64,
    #[serde(
        default,
        with = "unix_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub edit_date: Option<i64>,
    pub chat: Chat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate_to_chat_id: Option<i64>,
}

impl Message {
    /// The text span an entity points at, or `None` if the entity range does
    /// not fit the text.
    pub fn entity_text(&self, entity: &MessageEntity) -> Option<&str> {
        utf16_slice(self.text.as_deref()?, entity.offset, entity.length)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// One envelope from `getUpdates`. At most one of the variant fields is set;
/// variant kinds this crate does not consume end up in `unknown` so the
/// demultiplexer can say what it dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_channel_post: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateContent {
    /// First non-empty of message, edited message, channel post, edited
    /// channel post. All four feed the same downstream flow.
    Message(Message),
    CallbackQuery(CallbackQuery),
    /// Whatever variant keys were present but not recognized.
    Unsupported(Vec<String>),
}

impl Update {
    pub fn into_content(self) -> UpdateContent {
        if let Some(message) = self
            .message
            .or(self.edited_message)
            .or(self.channel_post)
            .or(self.edited_channel_post)
        {
            UpdateContent::Message(message)
        } else if let Some(query) = self.callback_query {
            UpdateContent::CallbackQuery(query)
        } else {
            UpdateContent::Unsupported(self.unknown.keys().cloned().collect())
        }
    }
}

/// Maps a UTF-16 code-unit range onto the underlying `&str`. Returns `None`
/// if the range is out of bounds or splits a surrogate pair.
pub fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<&str> {
    let end = offset.checked_add(length)?;
    let mut start_byte = None;
    let mut units = 0usize;

    for (byte, ch) in text.char_indices() {
        if units == offset && start_byte.is_none() {
            start_byte = Some(byte);
        }
        if units == end {
            return Some(&text[start_byte?..byte]);
        }
        if units > offset && start_byte.is_none() {
            return None;
        }
        units += ch.len_utf16();
    }

    if units == offset && start_byte.is_none() {
        start_byte = Some(text.len());
    }
    if units == end {
        return Some(&text[start_byte?..]);
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(id: &ChatId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn chat_id_parsing() {
        assert_eq!(ChatId::from("42"), ChatId::Id(42));
        assert_eq!(ChatId::from("-1001234"), ChatId::Id(-1001234));
        assert_eq!(ChatId::from("@somechannel"), ChatId::Username("@somechannel".into()));
        assert_eq!(ChatId::from("somechannel"), ChatId::Username("somechannel".into()));
    }

    #[test]
    fn chat_id_equality_ignores_case_and_at() {
        let a = ChatId::from("@SomeChannel");
        let b = ChatId::from("somechannel");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(ChatId::from("@a"), ChatId::from("@b"));
        assert_ne!(ChatId::Id(5), ChatId::from("@5x"));
    }

    #[test]
    fn chat_id_ordering() {
        let mut ids = vec![
            ChatId::Id(7),
            ChatId::from("@beta"),
            ChatId::Id(-3),
            ChatId::from("@Alpha"),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ChatId::from("@Alpha"),
                ChatId::from("@beta"),
                ChatId::Id(-3),
                ChatId::Id(7),
            ]
        );
    }

    #[test]
    fn chat_id_serde_preserves_variant() {
        let id: ChatId = serde_json::from_str("42").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");

        let name: ChatId = serde_json::from_str("\"channel\"").unwrap();
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"@channel\"");

        let at: ChatId = serde_json::from_str("\"@channel\"").unwrap();
        assert_eq!(serde_json::to_string(&at).unwrap(), "\"@channel\"");
    }

    #[test]
    fn chat_id_rendering() {
        assert_eq!(ChatId::Id(-100).to_string(), "-100");
        assert_eq!(ChatId::from("name").to_string(), "@name");
        assert_eq!(ChatId::from("@name").to_string(), "@name");
    }

    #[test]
    fn utf16_slicing() {
        // "héllo" is 5 UTF-16 units but 6 bytes
        assert_eq!(utf16_slice("héllo", 1, 3), Some("éll"));
        assert_eq!(utf16_slice("héllo", 0, 5), Some("héllo"));
        assert_eq!(utf16_slice("héllo", 5, 0), Some(""));
        assert_eq!(utf16_slice("héllo", 4, 2), None);

        // '𝄞' occupies a surrogate pair
        assert_eq!(utf16_slice("𝄞ab", 2, 2), Some("ab"));
        assert_eq!(utf16_slice("𝄞ab", 0, 2), Some("𝄞"));
        assert_eq!(utf16_slice("𝄞ab", 1, 1), None);
        assert_eq!(utf16_slice("𝄞ab", 0, 1), None);
    }

    #[test]
    fn entity_text_uses_utf16_offsets() {
        let message: Message = serde_json::from_value(serde_json::json!({
            "message_id": 1,
            "date": 1700000000,
            "chat": {"id": 42, "type": "private"},
            "text": "𝄞 /start now",
            "entities": [{"type": "bot_command", "offset": 3, "length": 6}]
        }))
        .unwrap();

        let entity = &message.entities[0];
        assert_eq!(entity.kind, EntityKind::BotCommand);
        assert_eq!(message.entity_text(entity), Some("/start"));
    }

    #[test]
    fn dates_accept_milliseconds_only_out_of_seconds_range() {
        let msg = |date: i64| {
            serde_json::from_value::<Message>(serde_json::json!({
                "message_id": 1,
                "date": date,
                "chat": {"id": 1, "type": "private"}
            }))
            .unwrap()
        };

        assert_eq!(msg(1_700_000_000).date, 1_700_000_000);
        assert_eq!(msg(1_700_000_000_123).date, 1_700_000_000);
        // large but still plausible seconds stay untouched
        assert_eq!(msg(999_999_999_999).date, 999_999_999_999);
    }

    #[test]
    fn update_classification() {
        let update: Update = serde_json::from_value(serde_json::json!({
            "update_id": 7,
            "edited_message": {
                "message_id": 2,
                "date": 1700000000,
                "chat": {"id": 1, "type": "private"},
                "text": "fixed"
            }
        }))
        .unwrap();
        assert!(matches!(update.into_content(), UpdateContent::Message(m) if m.text.as_deref() == Some("fixed")));

        let unsupported: Update = serde_json::from_value(serde_json::json!({
            "update_id": 8,
            "poll": {"id": "p1"}
        }))
        .unwrap();
        match unsupported.into_content() {
            UpdateContent::Unsupported(keys) => assert_eq!(keys, vec!["poll".to_string()]),
            other => panic!("unexpected content: {other:?}"),
        }
    }
}
