//! Typed client for the Bot API.
//!
//! Every request type implements [`Method`], which carries the wire method
//! name and the result shape at the type level; [`Client::execute`] is the
//! single generic entry point and the per-method helpers are thin wrappers
//! over it. The client performs no retries of its own.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{ChatId, Message, Update, User};

pub const BASE_URL: &str = "https://api.telegram.org";

/// A request to one Bot API method.
pub trait Method: Serialize + Send + Sync {
    const NAME: &'static str;
    type Output: DeserializeOwned + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedUpdate {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    CallbackQuery,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetUpdatesParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_updates: Option<Vec<AllowedUpdate>>,
}

impl Method for GetUpdatesParams {
    const NAME: &'static str = "getUpdates";
    type Output = Vec<Update>;
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GetMe {}

impl Method for GetMe {
    const NAME: &'static str = "getMe";
    type Output = User;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    #[serde(rename = "MarkdownV2")]
    MarkdownV2,
    #[serde(rename = "HTML")]
    Html,
    #[serde(rename = "Markdown")]
    Markdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageParams {
    pub chat_id: ChatId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_notification: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
}

impl SendMessageParams {
    pub fn new(chat_id: impl Into<ChatId>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            parse_mode: None,
            disable_notification: None,
            reply_to_message_id: None,
        }
    }
}

impl Method for SendMessageParams {
    const NAME: &'static str = "sendMessage";
    type Output = Message;
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerCallbackQueryParams {
    pub callback_query_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_alert: Option<bool>,
}

impl Method for AnswerCallbackQueryParams {
    const NAME: &'static str = "answerCallbackQuery";
    type Output = bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotCommandScope {
    Default,
    AllPrivateChats,
    AllGroupChats,
    AllChatAdministrators,
    Chat { chat_id: ChatId },
}

#[derive(Debug, Clone, Serialize)]
pub struct SetMyCommandsParams {
    pub commands: Vec<BotCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<BotCommandScope>,
}

impl Method for SetMyCommandsParams {
    const NAME: &'static str = "setMyCommands";
    type Output = bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate_to_chat_id: Option<i64>,
}

/// An `ok = false` response body, or a well-formed response the caller
/// cannot use (`ok = true` without a result carries a synthetic code 0).
#[derive(Debug, Clone, PartialEq, thiserror::Error, Deserialize)]
#[error("telegram error {error_code}: {description}")]
pub struct ErrorResponse {
    pub description: String,
    pub error_code: i64,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Api(#[from] ErrorResponse),
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    pub fn error_code(&self) -> Option<i64> {
        match self {
            Error::Api(response) => Some(response.error_code),
            _ => None,
        }
    }

    /// Server-requested minimum pause before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Api(response) => response
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs),
            _ => None,
        }
    }

    pub fn migrate_to_chat_id(&self) -> Option<i64> {
        match self {
            Error::Api(response) => response.parameters.and_then(|p| p.migrate_to_chat_id),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, ErrorResponse> {
        match self {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { ok: true, .. } => Err(ErrorResponse {
                description: "ok response without a result".to_string(),
                error_code: 0,
                parameters: None,
            }),
            ApiResponse {
                description,
                error_code,
                parameters,
                ..
            } => Err(ErrorResponse {
                description: description.unwrap_or_else(|| "unknown error".to_string()),
                error_code: error_code.unwrap_or(0),
                parameters,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    api_url: String,
}

impl Client {
    pub fn new(token: &str) -> Self {
        let base = Url::parse(BASE_URL).expect("base url should be valid!");
        Self::with_base_url(base, token)
    }

    /// Point the client at a different server, e.g. a local Bot API server.
    pub fn with_base_url(base: Url, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: format!("{}/bot{token}", base.as_str().trim_end_matches('/')),
        }
    }

    pub async fn execute<M: Method>(&self, method: &M) -> Result<M::Output, Error> {
        let url = format!("{}/{}", self.api_url, M::NAME);
        let response = self.http.post(&url).json(method).send().await?;

        // `ok = false` bodies usually come with a 4xx status; the body is
        // authoritative when it decodes, the status only when it does not.
        let http_error = response.error_for_status_ref().err();
        let body = response.bytes().await?;

        match (
            serde_json::from_slice::<ApiResponse<M::Output>>(&body),
            http_error,
        ) {
            (Ok(envelope), _) => Ok(envelope.into_result()?),
            (Err(_), Some(status)) => Err(Error::Transport(status)),
            (Err(decode), None) => Err(Error::Decode(decode)),
        }
    }

    pub async fn get_me(&self) -> Result<User, Error> {
        self.execute(&GetMe {}).await
    }

    pub async fn get_updates(&self, params: &GetUpdatesParams) -> Result<Vec<Update>, Error> {
        self.execute(params).await
    }

    pub async fn send_message(&self, params: &SendMessageParams) -> Result<Message, Error> {
        self.execute(params).await
    }

    pub async fn answer_callback_query(
        &self,
        params: &AnswerCallbackQueryParams,
    ) -> Result<bool, Error> {
        self.execute(params).await
    }

    pub async fn set_my_commands(&self, params: &SetMyCommandsParams) -> Result<bool, Error> {
        self.execute(params).await
    }
}

/// The one capability the update pump needs. [`Client`] implements it; tests
/// and alternative transports substitute their own sources.
pub trait UpdateSource: Send + Sync + 'static {
    fn get_updates(
        &self,
        params: &GetUpdatesParams,
    ) -> impl Future<Output = Result<Vec<Update>, Error>> + Send;
}

impl UpdateSource for Client {
    fn get_updates(
        &self,
        params: &GetUpdatesParams,
    ) -> impl Future<Output = Result<Vec<Update>, Error>> + Send {
        self.execute(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bodies_omit_unset_fields() {
        let params = GetUpdatesParams {
            offset: Some(8),
            timeout: Some(60),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({"offset": 8, "timeout": 60})
        );

        let params = GetUpdatesParams {
            allowed_updates: Some(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({"allowed_updates": ["message", "callback_query"]})
        );
    }

    #[test]
    fn scope_is_internally_tagged() {
        let scope = BotCommandScope::Chat {
            chat_id: ChatId::from("@ops"),
        };
        assert_eq!(
            serde_json::to_value(&scope).unwrap(),
            serde_json::json!({"type": "chat", "chat_id": "@ops"})
        );
        assert_eq!(
            serde_json::to_value(BotCommandScope::AllPrivateChats).unwrap(),
            serde_json::json!({"type": "all_private_chats"})
        );
    }

    #[test]
    fn error_envelope_decoding() {
        let envelope: ApiResponse<Vec<Update>> = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 30","parameters":{"retry_after":30}}"#,
        )
        .unwrap();
        let error = Error::Api(envelope.into_result().unwrap_err());
        assert_eq!(error.error_code(), Some(429));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(error.migrate_to_chat_id(), None);
    }

    #[test]
    fn ok_without_result_is_a_protocol_error() {
        let envelope: ApiResponse<Vec<Update>> = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        let error = envelope.into_result().unwrap_err();
        assert_eq!(error.error_code, 0);
    }

    #[test]
    fn migration_hint_is_surfaced() {
        let envelope: ApiResponse<Message> = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: group chat was upgraded to a supergroup chat","parameters":{"migrate_to_chat_id":-100123}}"#,
        )
        .unwrap();
        let error = Error::Api(envelope.into_result().unwrap_err());
        assert_eq!(error.migrate_to_chat_id(), Some(-100123));
    }

    #[test]
    fn result_envelope_decoding() {
        let envelope: ApiResponse<bool> =
            serde_json::from_str(r#"{"ok":true,"result":true}"#).unwrap();
        assert_eq!(envelope.into_result().unwrap(), true);
    }
}
