use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorPayload;
use crate::models::{Character, DiceResult, DiceRoll, Note, NotePatch, SafeUser, Sketch, Token};

/// Metadata envelope: every payload leaves the server as `{ dateTime, ...payload }`
/// so clients can order and de-duplicate independently of delivery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped<T> {
    #[serde(rename = "dateTime")]
    pub date_time: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> Stamped<T> {
    pub fn now(payload: T) -> Self {
        Self {
            date_time: Utc::now(),
            payload,
        }
    }
}

/// Events sent over the gateway, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A participant entered the room
    Join(Stamped<Presence>),

    /// A participant left the room
    Leave(Stamped<Presence>),

    SketchUpdate(Stamped<SketchBroadcast>),

    DiceResult(Stamped<DiceBroadcast>),

    NoteUpdate(Stamped<Note>),

    NoteDelete(Stamped<NoteRemoved>),

    AudioPlay(Stamped<AudioPlayRequest>),

    AudioStop(Stamped<AudioStopped>),

    /// Sent to the master only
    CharacterUpdate(Stamped<CharacterBroadcast>),

    /// A client event failed
    Error(Stamped<ErrorPayload>),

    /// The handshake was refused; the socket is closed right after
    #[serde(rename = "connect_error")]
    ConnectError(Stamped<ErrorPayload>),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::SketchUpdate(_) => "sketchUpdate",
            Self::DiceResult(_) => "diceResult",
            Self::NoteUpdate(_) => "noteUpdate",
            Self::NoteDelete(_) => "noteDelete",
            Self::AudioPlay(_) => "audioPlay",
            Self::AudioStop(_) => "audioStop",
            Self::CharacterUpdate(_) => "characterUpdate",
            Self::Error(_) => "error",
            Self::ConnectError(_) => "connect_error",
        }
    }
}

/// Events sent over the gateway, client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Master only: replace the whole sketch
    SketchUpdate(Sketch),

    /// Replace one token by id
    TokenUpdate(Token),

    DiceRequest(Vec<DiceRoll>),

    /// Master only: result goes back to the requester alone
    DicePrivateRequest(Vec<DiceRoll>),

    NoteUpdate(NoteUpdateRequest),

    NoteDelete(NoteDeleteRequest),

    AudioPlay(AudioPlayRequest),

    AudioStop,

    /// A player changed their character; the master gets notified
    CharacterUpdate,
}

// -- Payloads --

/// One entry of the presence list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    #[serde(flatten)]
    pub user: SafeUser,
    pub socket_id: Uuid,
    pub is_master: bool,
    pub character: Option<Character>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    /// Who joined or left
    pub user: SessionUser,
    /// Everyone in the room after the change
    pub users: Vec<SessionUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchBroadcast {
    pub user: SafeUser,
    pub is_master: bool,
    pub sketch: Sketch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceBroadcast {
    pub user: SafeUser,
    pub is_master: bool,
    pub character: Option<Character>,
    #[serde(flatten)]
    pub result: DiceResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRemoved {
    pub note_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterBroadcast {
    pub user: SafeUser,
    pub character: Character,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioStopped {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteUpdateRequest {
    pub note_id: i64,
    #[serde(flatten)]
    pub patch: NotePatch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDeleteRequest {
    pub note_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPlayRequest {
    pub asset_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}
