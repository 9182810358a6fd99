//! Protocol Router (spec.md §4.4): classifies a freshly accepted connection
//! from its first bytes, under a bounded peek budget and deadline. The
//! peeked bytes are returned to the caller, never discarded, so the chosen
//! codec sees them as the start of its stream.

use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::error::RouterError;
use crate::model::device::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Tfms90,
    Teltonika,
}

impl From<RouteDecision> for Protocol {
    fn from(decision: RouteDecision) -> Self {
        match decision {
            RouteDecision::Tfms90 => Protocol::Tfms90,
            RouteDecision::Teltonika => Protocol::Teltonika,
        }
    }
}

pub struct RouterOutcome {
    pub decision: RouteDecision,
    /// Every byte read during classification. Must be fed to the chosen
    /// codec before any further socket reads (spec.md §4.4: "never
    /// discarded").
    pub peeked: Vec<u8>,
}

enum Verdict {
    Matched(RouteDecision),
    Rejected,
    NeedMoreBytes,
}

/// Rule order follows spec.md §4.4 exactly: `$` (optionally preceded by
/// `\n`/`\r`) selects TFMS90; otherwise a two-byte length of exactly 15
/// followed by 15 ASCII digits selects Teltonika; otherwise neither.
fn classify(buf: &[u8], peek_cap: usize) -> Verdict {
    let mut idx = 0;
    while idx < buf.len() && (buf[idx] == b'\n' || buf[idx] == b'\r') {
        idx += 1;
    }
    let rule1 = if idx < buf.len() { Some(buf[idx] == b'$') } else { None };

    let rule2 = if buf.len() >= 2 {
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len != 15 {
            Some(false)
        } else if buf.len() >= 2 + len {
            Some(buf[2..2 + len].iter().all(u8::is_ascii_digit))
        } else if 2 + len > peek_cap {
            Some(false)
        } else {
            None
        }
    } else {
        None
    };

    match (rule1, rule2) {
        (Some(true), _) => Verdict::Matched(RouteDecision::Tfms90),
        (_, Some(true)) => Verdict::Matched(RouteDecision::Teltonika),
        (Some(false), Some(false)) => Verdict::Rejected,
        _ => Verdict::NeedMoreBytes,
    }
}

/// Reads from `socket` until the connection can be classified, the peek
/// budget (`peek_bytes`) is exhausted, or `deadline` elapses.
pub async fn route<S>(socket: &mut S, peek_bytes: usize, deadline: Duration) -> Result<RouterOutcome, RouterError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(peek_bytes);
    let deadline_at = tokio::time::Instant::now() + deadline;

    loop {
        match classify(&buf, peek_bytes) {
            Verdict::Matched(decision) => return Ok(RouterOutcome { decision, peeked: buf }),
            Verdict::Rejected => return Err(RouterError::NoProtocolMatched),
            Verdict::NeedMoreBytes => {}
        }

        if buf.len() >= peek_bytes {
            return Err(RouterError::NoProtocolMatched);
        }

        let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(RouterError::PeekTimeout);
        }

        let mut chunk = [0u8; 64];
        let want = (peek_bytes - buf.len()).min(chunk.len());
        let n = tokio::time::timeout(remaining, socket.read(&mut chunk[..want]))
            .await
            .map_err(|_| RouterError::PeekTimeout)?
            .map_err(RouterError::Io)?;

        if n == 0 {
            return Err(RouterError::NoProtocolMatched);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn routes_dollar_prefixed_stream_to_tfms90() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"$,0,LG,867762040399039,2.0.1,8997,#?").await.unwrap();
        let outcome = route(&mut server, 64, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.decision, RouteDecision::Tfms90);
        assert!(outcome.peeked.starts_with(b"$"));
    }

    #[tokio::test]
    async fn routes_length_prefixed_imei_to_teltonika() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let imei = b"123456789012345";
        let mut bytes = (imei.len() as u16).to_be_bytes().to_vec();
        bytes.extend_from_slice(imei);
        client.write_all(&bytes).await.unwrap();
        let outcome = route(&mut server, 64, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.decision, RouteDecision::Teltonika);
        assert_eq!(outcome.peeked, bytes);
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"\x00\x05hello-not-digits-and-not-dollar").await.unwrap();
        let result = route(&mut server, 64, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RouterError::NoProtocolMatched)));
    }

    #[tokio::test]
    async fn times_out_on_silent_connection() {
        let (_client, mut server) = tokio::io::duplex(256);
        let result = route(&mut server, 64, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(RouterError::PeekTimeout)));
    }
}
