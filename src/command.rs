//! Bot command extraction from incoming messages.
//!
//! A command is a `bot_command` entity or, when the message carries no
//! entities at all, a leading-`/` text. Offsets are UTF-16 code units.

use regex::{Regex, RegexBuilder, escape};

use crate::types::{EntityKind, Message, utf16_slice};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand<'a> {
    /// Lowercased command name, without the slash or the `@mention`.
    pub command: String,
    pub username: Option<&'a str>,
    pub args: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CommandParser {
    pattern: Regex,
    username: Option<String>,
}

impl CommandParser {
    /// `username` is the bot's own name; when given, commands explicitly
    /// addressed to a different bot are ignored.
    pub fn new(username: Option<&str>) -> Self {
        let pattern = if let Some(username) = username {
            format!("^/([^@\\s]+)(?:@({}))?(?:\\s+(.*))?$", escape(username))
        } else {
            "^/([^@\\s]+)(?:@(\\S+))?(?:\\s+(.*))?$".to_string()
        };

        let pattern = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("regex should be valid!");

        Self {
            pattern,
            username: username.map(str::to_string),
        }
    }

    pub fn parse<'a>(&self, message: &'a Message) -> Option<ParsedCommand<'a>> {
        let text = message.text.as_deref()?;

        if message.entities.is_empty() {
            return self.parse_text(text);
        }

        let entity = message
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::BotCommand)?;
        let token = utf16_slice(text, entity.offset, entity.length)?;

        let (command, username) = match token.strip_prefix('/')?.split_once('@') {
            Some((command, username)) => (command, Some(username)),
            None => (token.strip_prefix('/')?, None),
        };
        if command.is_empty() {
            return None;
        }
        if let (Some(own), Some(mentioned)) = (&self.username, username) {
            if !own.eq_ignore_ascii_case(mentioned) {
                return None;
            }
        }

        let total: usize = text.encode_utf16().count();
        let rest = entity
            .offset
            .checked_add(entity.length)
            .and_then(|end| utf16_slice(text, end, total.checked_sub(end)?))
            .map(str::trim_start)
            .filter(|rest| !rest.is_empty());

        Some(ParsedCommand {
            command: command.to_lowercase(),
            username,
            args: rest,
        })
    }

    fn parse_text<'a>(&self, text: &'a str) -> Option<ParsedCommand<'a>> {
        let captures = self.pattern.captures(text)?;
        Some(ParsedCommand {
            command: captures
                .get(1)
                .expect("group matches always")
                .as_str()
                .to_lowercase(),
            username: captures.get(2).map(|m| m.as_str()),
            args: captures.get(3).map(|m| m.as_str()),
        })
    }
}
