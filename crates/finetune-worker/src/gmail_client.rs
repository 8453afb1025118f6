//! Gmail API client for reading a user's sent mail.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::{Message, MessagePart};
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::Gmail;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Gmail caps `maxResults` on a single list page.
const MAX_PAGE_SIZE: u32 = 500;

/// A sent message with the fields needed to build a training example.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentMessage {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub to: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// An opened mailbox: paginated listing plus per-id fetch.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Ids of the most recent sent messages, newest first, at most `max`.
    async fn list_sent(&self, max: u32) -> Result<Vec<String>>;

    async fn get_message(&self, message_id: &str) -> Result<SentMessage>;
}

/// Opens a [`Mailbox`] for a live access token.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn open(&self, access_token: &str) -> Result<Box<dyn Mailbox>>;
}

/// Opens [`GmailClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct GmailSource;

#[async_trait]
impl MailSource for GmailSource {
    async fn open(&self, access_token: &str) -> Result<Box<dyn Mailbox>> {
        Ok(Box::new(GmailClient::from_access_token(access_token)?))
    }
}

/// Client for interacting with Gmail API
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    /// Create a client that authenticates every call with an already
    /// refreshed access token.
    pub fn from_access_token(access_token: &str) -> Result<Self> {
        let connector = google_gmail1::hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native TLS roots")?
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);
        let hub = Gmail::new(client, access_token.to_string());

        Ok(Self { hub })
    }

    fn parse_message(message: Message) -> SentMessage {
        let id = message.id.clone().unwrap_or_default();
        let thread_id = message.thread_id.clone().unwrap_or_default();

        let mut subject = String::new();
        let mut to = Vec::new();
        let mut sent_at = None;

        if let Some(headers) = message.payload.as_ref().and_then(|p| p.headers.as_ref()) {
            for header in headers {
                match header.name.as_deref() {
                    Some("Subject") => subject = header.value.clone().unwrap_or_default(),
                    Some("To") => {
                        if let Some(val) = &header.value {
                            to = Self::parse_address_list(val);
                        }
                    }
                    Some("Date") => {
                        if let Some(date_str) = &header.value {
                            sent_at = Self::parse_date(date_str);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (body_text, body_html) = Self::extract_bodies(&message);

        SentMessage {
            id,
            thread_id,
            subject,
            to,
            body_text,
            body_html,
            sent_at,
        }
    }

    fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc2822(date_str)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn parse_address_list(header_value: &str) -> Vec<String> {
        header_value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn extract_bodies(message: &Message) -> (Option<String>, Option<String>) {
        let payload = match message.payload.as_ref() {
            Some(p) => p,
            None => return (None, None),
        };

        let mut text_body = None;
        let mut html_body = None;

        if let Some(decoded) = Self::part_data(payload) {
            match payload.mime_type.as_deref() {
                Some("text/html") => html_body = Some(decoded),
                _ => text_body = Some(decoded),
            }
        }

        if let Some(parts) = &payload.parts {
            Self::extract_bodies_from_parts(parts, &mut text_body, &mut html_body);
        }

        (text_body, html_body)
    }

    fn extract_bodies_from_parts(
        parts: &[MessagePart],
        text_body: &mut Option<String>,
        html_body: &mut Option<String>,
    ) {
        for part in parts {
            match part.mime_type.as_deref() {
                Some("text/plain") if text_body.is_none() => {
                    *text_body = Self::part_data(part);
                }
                Some("text/html") if html_body.is_none() => {
                    *html_body = Self::part_data(part);
                }
                Some(mime) if mime.starts_with("multipart/") => {
                    if let Some(nested_parts) = &part.parts {
                        Self::extract_bodies_from_parts(nested_parts, text_body, html_body);
                    }
                }
                _ => {}
            }
        }
    }

    fn part_data(part: &MessagePart) -> Option<String> {
        let data = part.body.as_ref()?.data.as_ref()?;
        String::from_utf8(data.to_vec()).ok()
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    async fn list_sent(&self, max: u32) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < max {
            let remaining = max - ids.len() as u32;
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .add_label_ids("SENT")
                .max_results(remaining.min(MAX_PAGE_SIZE));
            if let Some(token) = &page_token {
                call = call.page_token(token);
            }

            let (_, response) = call.doit().await.context("Failed to list sent messages")?;

            ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(max as usize);
        Ok(ids)
    }

    async fn get_message(&self, message_id: &str) -> Result<SentMessage> {
        let (_, message) = self
            .hub
            .users()
            .messages_get("me", message_id)
            .format("full")
            .doit()
            .await
            .with_context(|| format!("Failed to get message {}", message_id))?;

        Ok(Self::parse_message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn leaf(mime: &str, data: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            body: Some(MessagePartBody {
                data: Some(data.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_multipart_message() {
        let message = Message {
            id: Some("m1".to_string()),
            thread_id: Some("t1".to_string()),
            payload: Some(MessagePart {
                mime_type: Some("multipart/alternative".to_string()),
                headers: Some(vec![
                    header("Subject", "Re: Budget"),
                    header("To", "alice@example.com, bob@example.com"),
                    header("Date", "Tue, 1 Oct 2024 10:00:00 +0000"),
                ]),
                parts: Some(vec![
                    leaf("text/plain", "plain body"),
                    leaf("text/html", "<p>html body</p>"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let parsed = GmailClient::parse_message(message);
        assert_eq!(parsed.subject, "Re: Budget");
        assert_eq!(parsed.to, vec!["alice@example.com", "bob@example.com"]);
        assert_eq!(parsed.body_text.as_deref(), Some("plain body"));
        assert_eq!(parsed.body_html.as_deref(), Some("<p>html body</p>"));
        assert!(parsed.sent_at.is_some());
    }

    #[test]
    fn test_single_part_html_body() {
        let mut payload = leaf("text/html", "<b>hi</b>");
        payload.headers = Some(vec![header("Subject", "Hello")]);
        let message = Message {
            payload: Some(payload),
            ..Default::default()
        };

        let parsed = GmailClient::parse_message(message);
        assert!(parsed.body_text.is_none());
        assert_eq!(parsed.body_html.as_deref(), Some("<b>hi</b>"));
    }
}
