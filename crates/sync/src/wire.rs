use parley_storage::ScopeKey;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

use crate::events::{EventKind, LiveEvent, Message};

const EVENT_PREFIX: &str = "chat:";
const CREATED_SUFFIX: &str = ":messages";
const UPDATED_SUFFIX: &str = ":messages:update";

/// One named push frame as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveFrame {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WireError {
    #[snafu(display("unrecognized live event name `{event}` on `{stage}`"))]
    UnknownEvent { stage: &'static str, event: String },
    #[snafu(display("invalid scope in live event `{event}` on `{stage}`: {source}"))]
    EventScope {
        stage: &'static str,
        event: String,
        source: parley_storage::StorageError,
    },
    #[snafu(display("malformed payload for `{event}` on `{stage}`: {source}"))]
    Payload {
        stage: &'static str,
        event: String,
        source: serde_json::Error,
    },
    #[snafu(display(
        "payload scope {payload_scope} does not match event `{event}` on `{stage}`"
    ))]
    ScopeMismatch {
        stage: &'static str,
        event: String,
        payload_scope: ScopeKey,
    },
}

pub type WireResult<T> = Result<T, WireError>;

/// Event name a transport uses for `kind` in `scope`.
pub fn event_key(kind: EventKind, scope: ScopeKey) -> String {
    match kind {
        EventKind::Created => format!("{EVENT_PREFIX}{scope}{CREATED_SUFFIX}"),
        EventKind::Updated => format!("{EVENT_PREFIX}{scope}{UPDATED_SUFFIX}"),
    }
}

fn parse_event_name(event: &str) -> WireResult<(EventKind, ScopeKey)> {
    let unknown = || UnknownEventSnafu {
        stage: "wire-parse-event-name",
        event: event.to_string(),
    };
    let Some(rest) = event.strip_prefix(EVENT_PREFIX) else {
        return unknown().fail();
    };

    // The update suffix contains the created suffix, so it must be tried first.
    let (kind, raw_scope) = if let Some(raw) = rest.strip_suffix(UPDATED_SUFFIX) {
        (EventKind::Updated, raw)
    } else if let Some(raw) = rest.strip_suffix(CREATED_SUFFIX) {
        (EventKind::Created, raw)
    } else {
        return unknown().fail();
    };

    let scope = ScopeKey::parse(raw_scope).context(EventScopeSnafu {
        stage: "wire-parse-event-scope",
        event: event.to_string(),
    })?;
    Ok((kind, scope))
}

pub fn decode_frame(frame: &LiveFrame) -> WireResult<LiveEvent> {
    let (kind, scope) = parse_event_name(&frame.event)?;
    let message: Message =
        serde_json::from_value(frame.payload.clone()).context(PayloadSnafu {
            stage: "wire-decode-payload",
            event: frame.event.clone(),
        })?;
    ensure!(
        message.scope == scope,
        ScopeMismatchSnafu {
            stage: "wire-decode-scope-check",
            event: frame.event.clone(),
            payload_scope: message.scope,
        }
    );

    Ok(match kind {
        EventKind::Created => LiveEvent::Created(message),
        EventKind::Updated => LiveEvent::Updated(message),
    })
}

pub fn encode_event(event: &LiveEvent) -> WireResult<LiveFrame> {
    let name = event_key(event.kind(), event.scope());
    let payload = serde_json::to_value(event.message()).context(PayloadSnafu {
        stage: "wire-encode-payload",
        event: name.clone(),
    })?;
    Ok(LiveFrame {
        event: name,
        payload,
    })
}
