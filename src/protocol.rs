//! Request and response heads exchanged before the event stream starts.
//!
//! A client opens a session by writing:
//!
//! ```text
//! OPEN <session-id>
//! Last-Event-ID: <id>
//!
//! ```
//!
//! The `Last-Event-ID` line is optional; without it the server starts from
//! the beginning. The server answers with a status line, header lines, and a
//! blank line. `200 OK` is followed directly by the event stream. Refusals use
//! `429 Too Many Requests` or `503 Service Unavailable`, carry conventional
//! retry headers, and end with one line of JSON holding the same facts.
//!
//! While a session waits in the admission queue the server may write
//! `: queued` comment lines ahead of the status line, so clients can tell a
//! queued session from a dead server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt},
    time::Instant,
};

use crate::{
    admission::{AdmissionError, Rejection},
    event::EventId,
};

/// Maximum number of bytes read while parsing any head.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

const LAST_EVENT_ID: &str = "Last-Event-ID";

/// Errors raised while reading or writing a head.
#[derive(Debug, Error)]
pub enum HeadError {
    /// Underlying I/O failure.
    #[error("head i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection mid-head.
    #[error("connection closed before head completed")]
    UnexpectedEof,
    /// The head exceeded [`MAX_HEAD_LEN`].
    #[error("head exceeds {max} bytes")]
    TooLong {
        /// Byte limit that was exceeded.
        max: usize,
    },
    /// A line could not be parsed.
    #[error("malformed head line: {0:?}")]
    Malformed(String),
    /// The server answered with a status this client does not understand.
    #[error("unexpected status {code} {reason}")]
    UnexpectedStatus {
        /// Numeric status code.
        code: u16,
        /// Reason phrase.
        reason: String,
    },
    /// The rejection body was not valid JSON.
    #[error("invalid rejection body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    /// The rejection body named an unknown reason.
    #[error("unknown rejection reason {0:?}")]
    UnknownReason(String),
}

/// Read one `\n`-terminated line, charging its length against `budget`.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<String, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let limit = u64::try_from(*budget).unwrap_or(u64::MAX);
    let read = (&mut *reader).take(limit).read_line(&mut line).await?;
    *budget -= read;
    if !line.ends_with('\n') {
        return Err(if *budget == 0 {
            HeadError::TooLong { max: MAX_HEAD_LEN }
        } else {
            HeadError::UnexpectedEof
        });
    }
    line.pop();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Read `Name: value` lines up to the blank line ending the head.
async fn read_headers<R>(
    reader: &mut R,
    budget: &mut usize,
) -> Result<Vec<(String, String)>, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, budget).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::Malformed(line.clone()))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
}

fn is_single_token(value: &str) -> bool {
    !value.is_empty() && !value.contains(char::is_whitespace)
}

/// Session open request sent by the client on every connection attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    /// Logical session identifier.
    pub session_id: String,
    /// Last event the client delivered, if resuming.
    pub last_event_id: Option<EventId>,
}

impl OpenRequest {
    /// Request the stream for `session_id` from the beginning.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_event_id: None,
        }
    }

    /// Resume after `last_event_id`.
    #[must_use]
    pub fn resume_after(mut self, last_event_id: Option<EventId>) -> Self {
        self.last_event_id = last_event_id;
        self
    }

    /// Serialize the request head.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Malformed`] if the session id is empty or contains
    /// whitespace, or if the resume id is empty or contains whitespace.
    pub fn encode(&self) -> Result<String, HeadError> {
        if !is_single_token(&self.session_id) {
            return Err(HeadError::Malformed(self.session_id.clone()));
        }
        let mut head = format!("OPEN {}\n", self.session_id);
        if let Some(id) = &self.last_event_id {
            if !is_single_token(id.as_str()) {
                return Err(HeadError::Malformed(id.to_string()));
            }
            head.push_str(&format!("{LAST_EVENT_ID}: {id}\n"));
        }
        head.push('\n');
        Ok(head)
    }

    /// Read a request head from `reader`. Unknown headers are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError`] if the head is truncated, too long, or malformed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HeadError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut budget = MAX_HEAD_LEN;
        let line = read_line(reader, &mut budget).await?;
        let session_id = line
            .strip_prefix("OPEN ")
            .map(str::trim)
            .filter(|id| is_single_token(id))
            .ok_or_else(|| HeadError::Malformed(line.clone()))?
            .to_owned();
        let last_event_id = read_headers(reader, &mut budget)
            .await?
            .into_iter()
            .rev()
            .find(|(name, _)| name.eq_ignore_ascii_case(LAST_EVENT_ID))
            .map(|(_, value)| EventId::from(value))
            .filter(|id| !id.as_str().is_empty());
        Ok(Self {
            session_id,
            last_event_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RejectionBody {
    error: String,
    retry_after: u64,
    limit: usize,
    remaining: usize,
    reset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_size: Option<usize>,
}

/// Server answer to an [`OpenRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseHead {
    /// The stream follows.
    Accepted,
    /// The session was refused; retry according to the attached guidance.
    Rejected(AdmissionError),
}

impl ResponseHead {
    /// Serialize the head, including the JSON body for refusals.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::InvalidBody`] if the body cannot be serialized.
    pub fn encode(&self) -> Result<String, HeadError> {
        let err = match self {
            Self::Accepted => return Ok("200 OK\n\n".to_owned()),
            Self::Rejected(err) => err,
        };
        let status = match err {
            AdmissionError::ShuttingDown(_) => "503 Service Unavailable",
            _ => "429 Too Many Requests",
        };
        let rejection = err.rejection();
        let body = RejectionBody {
            error: err.reason().to_owned(),
            retry_after: rejection.retry_after_secs(),
            limit: rejection.limit,
            remaining: rejection.remaining,
            reset: rejection.reset_unix_secs(),
            max_size: match err {
                AdmissionError::QueueFull { max_size, .. } => Some(*max_size),
                _ => None,
            },
        };
        Ok(format!(
            "{status}\nRetry-After: {}\nX-RateLimit-Limit: {}\nX-RateLimit-Remaining: {}\nX-RateLimit-Reset: {}\n\n{}\n",
            body.retry_after,
            body.limit,
            body.remaining,
            body.reset,
            serde_json::to_string(&body)?
        ))
    }

    /// Read a response head, and the JSON body of a refusal, from `reader`.
    ///
    /// Bytes after the head are left in `reader` for the event stream.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError`] for truncated, oversized, or malformed heads and
    /// for status codes other than 200, 429 and 503.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HeadError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut budget = MAX_HEAD_LEN;
        let line = read_line(reader, &mut budget).await?;
        let (code, reason) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let code: u16 = code
            .parse()
            .map_err(|_| HeadError::Malformed(line.clone()))?;
        read_headers(reader, &mut budget).await?;
        match code {
            200 => Ok(Self::Accepted),
            429 | 503 => {
                let body: RejectionBody =
                    serde_json::from_str(&read_line(reader, &mut budget).await?)?;
                let rejection = Rejection::new(
                    body.limit,
                    body.remaining,
                    Duration::from_secs(body.retry_after),
                    Instant::now(),
                );
                AdmissionError::from_reason(&body.error, body.max_size.unwrap_or(0), rejection)
                    .map(Self::Rejected)
                    .ok_or(HeadError::UnknownReason(body.error))
            }
            _ => Err(HeadError::UnexpectedStatus {
                code,
                reason: reason.to_owned(),
            }),
        }
    }
}

/// Head written when an open request cannot be parsed.
#[must_use]
pub fn bad_request() -> &'static str { "400 Bad Request\n\n" }

/// Comment written ahead of the response head while a session is queued.
///
/// `position` counts sessions ahead of this one.
#[must_use]
pub fn queued_notice(position: Option<usize>) -> String {
    match position {
        Some(ahead) => format!(": queued ahead={ahead}\n"),
        None => ": queued\n".to_owned(),
    }
}

/// Consume one queued notice if the next byte starts a comment.
///
/// Returns `None`, leaving `reader` untouched, once the response head begins.
///
/// # Errors
///
/// Returns [`HeadError`] if reading fails or the notice is truncated or too
/// long.
pub async fn read_queued_notice<R>(reader: &mut R) -> Result<Option<String>, HeadError>
where
    R: AsyncBufRead + Unpin,
{
    if reader.fill_buf().await?.first() != Some(&b':') {
        return Ok(None);
    }
    let mut budget = MAX_HEAD_LEN;
    let line = read_line(reader, &mut budget).await?;
    Ok(Some(line.trim_start_matches(':').trim().to_owned()))
}
