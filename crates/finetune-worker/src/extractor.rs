//! Turns sent messages into training examples.

use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use shared_types::TrainingExample;

use crate::gmail_client::{Mailbox, SentMessage};

/// Bodies shorter than this after cleaning carry too little style to learn from.
pub const MIN_BODY_CHARS: usize = 50;

static SIGNATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\n--[ \t]*\n.*$").expect("signature pattern"));
static SENT_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\nSent from my [^\n]*").expect("sent-from pattern"));
static SIGN_OFF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\n(?:Best regards|Kind regards|Thanks,).*$").expect("sign-off pattern")
});
static QUOTED_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\nOn [^\n]{1,200}wrote:.*$").expect("quote header pattern"));
static QUOTED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^>.*$").expect("quoted line pattern"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("blank line pattern"));

static HTML_DROP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:style|script|head)[^>]*>.*?</(?:style|script|head)>")
        .expect("html block pattern")
});
static HTML_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</(?:p|div|li|tr|h[1-6])>").expect("html break pattern"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("html tag pattern"));

/// Strip markup from an HTML body, keeping paragraph breaks.
pub fn html_to_text(html: &str) -> String {
    let text = HTML_DROP.replace_all(html, "");
    let text = HTML_BREAK.replace_all(&text, "\n");
    let text = HTML_TAG.replace_all(&text, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Remove signatures, sign-offs and quoted text. Returns `None` when what
/// remains is too short to be a usable example.
pub fn clean_body(raw: &str) -> Option<String> {
    let text = raw.replace("\r\n", "\n");
    let text: Vec<&str> = text.lines().map(str::trim_end).collect();
    let text = text.join("\n");

    let text = SIGNATURE.replace(&text, "");
    let text = QUOTED_HEADER.replace(&text, "");
    let text = SENT_FROM.replace_all(&text, "");
    let text = SIGN_OFF.replace(&text, "");
    let text = QUOTED_LINE.replace_all(&text, "");
    let text = BLANK_RUNS.replace_all(&text, "\n\n");

    let cleaned = text.trim();
    if cleaned.chars().count() < MIN_BODY_CHARS {
        return None;
    }
    Some(cleaned.to_string())
}

/// Cut to at most `max_chars` characters, on a char boundary.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

pub fn is_reply(subject: &str) -> bool {
    subject.trim_start().to_ascii_lowercase().starts_with("re:")
}

pub fn is_forward(subject: &str) -> bool {
    let lower = subject.trim_start().to_ascii_lowercase();
    lower.starts_with("fwd:") || lower.starts_with("fw:")
}

pub fn instruction_for(subject: &str) -> String {
    let subject = subject.trim();
    let subject = if subject.is_empty() {
        "(no subject)"
    } else {
        subject
    };

    if is_reply(subject) {
        let original = subject[3..].trim_start();
        format!(
            "Write a professional email reply about: {}\n\nContext: Previous email subject: {}",
            subject, original
        )
    } else {
        format!("Write a professional email about: {}", subject)
    }
}

/// Build a training example from one sent message, preferring the plain-text
/// body over HTML.
pub fn to_example(message: &SentMessage, max_chars: usize) -> Option<TrainingExample> {
    let raw = match (&message.body_text, &message.body_html) {
        (Some(text), _) if !text.trim().is_empty() => text.clone(),
        (_, Some(html)) => html_to_text(html),
        _ => return None,
    };
    let body = clean_body(&raw)?;

    let input = if message.to.is_empty() {
        String::new()
    } else {
        format!("To: {}", message.to.join(", "))
    };

    Some(TrainingExample {
        instruction: instruction_for(&message.subject),
        input,
        output: truncate(&body, max_chars),
    })
}

/// Fetch one batch of messages concurrently. Failed fetches are logged and
/// skipped.
pub async fn fetch_batch(mailbox: &dyn Mailbox, ids: &[String]) -> Vec<SentMessage> {
    let results = join_all(ids.iter().map(|id| mailbox.get_message(id))).await;

    results
        .into_iter()
        .zip(ids)
        .filter_map(|(result, id)| match result {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(message_id = %id, "Failed to fetch message: {:#}", e);
                None
            }
        })
        .collect()
}
