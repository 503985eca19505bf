//! The framed message protocol spoken between the broker and every client:
//! UI frontends, bot processes and market-adapter processes.
//!
//! Each frame carries a fixed 10-byte header (total length, message type,
//! request id) followed by a JSON payload specific to the message type. The
//! codec in [`codec`] handles framing; this module defines the typed message
//! set and its mapping to raw frames.

use arbor_core::{
    Balance, BotEngine, EntityId, EntityKind, EntityRef, Item, LogEntry, MarketAdapter, Marker,
    Order, Pid, Property, RunState, SupervisedKind, Transaction, KEY_SIZE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;

pub use codec::{Frame, FrameCodec, HEADER_LEN, MAX_FRAME_LEN};

/// Errors raised by the framing layer. Any of these is a protocol violation
/// that closes the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame header declared a length below the header size or above the
    /// hard maximum.
    #[error("invalid frame length {0}")]
    FrameLength(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Numeric message type carried in the frame header.
///
/// Unknown values decode to no message at all and are dropped by the router
/// without closing the connection.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum MessageType {
    Login = 1,
    LoginResponse = 2,
    Auth = 3,
    AuthResponse = 4,
    RegisterViewer = 5,
    RegisterViewerResponse = 6,
    RegisterHandler = 7,
    RegisterHandlerResponse = 8,
    Ping = 9,
    Pong = 10,
    CreateEntity = 11,
    CreateEntityResponse = 12,
    UpdateEntity = 13,
    UpdateEntityResponse = 14,
    RemoveEntity = 15,
    RemoveEntityResponse = 16,
    ControlEntity = 17,
    ControlEntityResponse = 18,
    RemoveAllEntities = 19,
    ErrorResponse = 20,
}

impl MessageType {
    /// Map a raw header value back to a message type.
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::Login,
            2 => Self::LoginResponse,
            3 => Self::Auth,
            4 => Self::AuthResponse,
            5 => Self::RegisterViewer,
            6 => Self::RegisterViewerResponse,
            7 => Self::RegisterHandler,
            8 => Self::RegisterHandlerResponse,
            9 => Self::Ping,
            10 => Self::Pong,
            11 => Self::CreateEntity,
            12 => Self::CreateEntityResponse,
            13 => Self::UpdateEntity,
            14 => Self::UpdateEntityResponse,
            15 => Self::RemoveEntity,
            16 => Self::RemoveEntityResponse,
            17 => Self::ControlEntity,
            18 => Self::ControlEntityResponse,
            19 => Self::RemoveAllEntities,
            20 => Self::ErrorResponse,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LoginRequest {
    pub user_name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LoginResponse {
    /// Public salt of the account, so the client can derive its HMAC key.
    pub user_key: [u8; KEY_SIZE],
    /// Single-use random challenge the client must sign.
    pub challenge: [u8; KEY_SIZE],
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AuthRequest {
    /// `HMAC-SHA256(challenge, user secret)`.
    pub signature: [u8; KEY_SIZE],
}

/// Sent by spawned processes to bind themselves to the entity they serve.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct RegisterRequest {
    pub kind: SupervisedKind,
    pub pid: Pid,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RegisterViewerResponse {
    pub session_id: Option<EntityId>,
    pub market_id: Option<EntityId>,
}

/// Context handed to a freshly registered handler process.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum RegisterHandlerResponse {
    Bot {
        market_adapter: String,
        currency_base: String,
        currency_comm: String,
        simulation: bool,
    },
    Market {
        venue_user_name: String,
        api_key: String,
        api_secret: String,
    },
}

/// Flat wire representation of a market (children travel separately).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketInfo {
    pub id: EntityId,
    pub adapter_id: EntityId,
    pub venue_user_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub run_state: RunState,
}

/// Flat wire representation of a session (ledger contents travel
/// separately).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: EntityId,
    pub name: String,
    pub engine_id: EntityId,
    pub market_id: EntityId,
    pub simulation: bool,
    pub run_state: RunState,
    pub balance: Balance,
}

/// Entity payload of a create/update message or its response.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "entity")]
pub enum EntityPayload {
    BotEngine(BotEngine),
    MarketAdapter(MarketAdapter),
    Market(MarketInfo),
    Session(SessionInfo),
    MarketBalance(Balance),
    MarketOrder(Order),
    MarketTransaction(Transaction),
    SessionOrder(Order),
    SessionTransaction(Transaction),
    SessionItem(Item),
    SessionProperty(Property),
    SessionMarker(Marker),
    SessionLogEntry(LogEntry),
}

impl EntityPayload {
    /// The entity kind this payload describes.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::BotEngine(_) => EntityKind::BotEngine,
            Self::MarketAdapter(_) => EntityKind::MarketAdapter,
            Self::Market(_) => EntityKind::Market,
            Self::Session(_) => EntityKind::Session,
            Self::MarketBalance(_) => EntityKind::MarketBalance,
            Self::MarketOrder(_) => EntityKind::MarketOrder,
            Self::MarketTransaction(_) => EntityKind::MarketTransaction,
            Self::SessionOrder(_) => EntityKind::SessionOrder,
            Self::SessionTransaction(_) => EntityKind::SessionTransaction,
            Self::SessionItem(_) => EntityKind::SessionItem,
            Self::SessionProperty(_) => EntityKind::SessionProperty,
            Self::SessionMarker(_) => EntityKind::SessionMarker,
            Self::SessionLogEntry(_) => EntityKind::SessionLogEntry,
        }
    }

    /// The id of the described entity. A balance has no id of its own.
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::BotEngine(engine) => engine.id,
            Self::MarketAdapter(adapter) => adapter.id,
            Self::Market(market) => market.id,
            Self::Session(session) => session.id,
            Self::MarketBalance(_) => 0,
            Self::MarketOrder(order) | Self::SessionOrder(order) => order.id,
            Self::MarketTransaction(tx) | Self::SessionTransaction(tx) => tx.id,
            Self::SessionItem(item) => item.id,
            Self::SessionProperty(property) => property.id,
            Self::SessionMarker(marker) => marker.id,
            Self::SessionLogEntry(entry) => entry.id,
        }
    }

    /// Reference to the described entity.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id())
    }
}

/// Command enum carried by a control message; the entity kind in the request
/// selects which commands are meaningful.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    // session control
    StartSimulation,
    StartLive,
    Stop,
    Select,
    RequestTransactions,
    RequestItems,
    RequestProperties,
    RequestOrders,
    // market control
    RefreshBalance,
    RefreshTransactions,
    RefreshOrders,
    RequestBalance,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ControlRequest {
    pub entity: EntityRef,
    pub command: ControlCommand,
}

/// Bulk data returned by the `Request*` family of control commands.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlData {
    #[default]
    None,
    Transactions(Vec<Transaction>),
    Items(Vec<Item>),
    Properties(Vec<Property>),
    Orders(Vec<Order>),
    Balance(Balance),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ControlResponse {
    pub entity: EntityRef,
    pub command: ControlCommand,
    #[serde(default)]
    pub data: ControlData,
}

/// Structured error reply naming the request that failed and, when known,
/// the entity it touched.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub message_type: MessageType,
    pub entity: Option<EntityRef>,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PingPayload {
    #[serde(default)]
    pub token: u64,
}

/// Every message the protocol can carry, decoded from a raw frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Login(LoginRequest),
    LoginResponse(LoginResponse),
    Auth(AuthRequest),
    AuthResponse,
    RegisterViewer(RegisterRequest),
    RegisterViewerResponse(RegisterViewerResponse),
    RegisterHandler(RegisterRequest),
    RegisterHandlerResponse(RegisterHandlerResponse),
    Ping(PingPayload),
    Pong(PingPayload),
    CreateEntity(EntityPayload),
    CreateEntityResponse(EntityPayload),
    UpdateEntity(EntityPayload),
    UpdateEntityResponse(EntityPayload),
    RemoveEntity(EntityRef),
    RemoveEntityResponse(EntityRef),
    ControlEntity(ControlRequest),
    ControlEntityResponse(ControlResponse),
    RemoveAllEntities { kind: EntityKind },
    ErrorResponse(ErrorResponse),
}

impl Message {
    /// The message type written into the frame header.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Login(_) => MessageType::Login,
            Self::LoginResponse(_) => MessageType::LoginResponse,
            Self::Auth(_) => MessageType::Auth,
            Self::AuthResponse => MessageType::AuthResponse,
            Self::RegisterViewer(_) => MessageType::RegisterViewer,
            Self::RegisterViewerResponse(_) => MessageType::RegisterViewerResponse,
            Self::RegisterHandler(_) => MessageType::RegisterHandler,
            Self::RegisterHandlerResponse(_) => MessageType::RegisterHandlerResponse,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::CreateEntity(_) => MessageType::CreateEntity,
            Self::CreateEntityResponse(_) => MessageType::CreateEntityResponse,
            Self::UpdateEntity(_) => MessageType::UpdateEntity,
            Self::UpdateEntityResponse(_) => MessageType::UpdateEntityResponse,
            Self::RemoveEntity(_) => MessageType::RemoveEntity,
            Self::RemoveEntityResponse(_) => MessageType::RemoveEntityResponse,
            Self::ControlEntity(_) => MessageType::ControlEntity,
            Self::ControlEntityResponse(_) => MessageType::ControlEntityResponse,
            Self::RemoveAllEntities { .. } => MessageType::RemoveAllEntities,
            Self::ErrorResponse(_) => MessageType::ErrorResponse,
        }
    }

    /// Decode a raw frame into a typed message.
    ///
    /// Returns `None` for unknown message types and for payloads that do not
    /// parse as the declared type; callers drop such frames silently.
    #[must_use]
    pub fn decode(frame: &Frame) -> Option<Self> {
        let message_type = MessageType::from_raw(frame.message_type)?;
        let payload = &frame.payload[..];
        Some(match message_type {
            MessageType::Login => Self::Login(parse(payload)?),
            MessageType::LoginResponse => Self::LoginResponse(parse(payload)?),
            MessageType::Auth => Self::Auth(parse(payload)?),
            MessageType::AuthResponse => Self::AuthResponse,
            MessageType::RegisterViewer => Self::RegisterViewer(parse(payload)?),
            MessageType::RegisterViewerResponse => Self::RegisterViewerResponse(parse(payload)?),
            MessageType::RegisterHandler => Self::RegisterHandler(parse(payload)?),
            MessageType::RegisterHandlerResponse => Self::RegisterHandlerResponse(parse(payload)?),
            MessageType::Ping => Self::Ping(parse(payload)?),
            MessageType::Pong => Self::Pong(parse(payload)?),
            MessageType::CreateEntity => Self::CreateEntity(parse(payload)?),
            MessageType::CreateEntityResponse => Self::CreateEntityResponse(parse(payload)?),
            MessageType::UpdateEntity => Self::UpdateEntity(parse(payload)?),
            MessageType::UpdateEntityResponse => Self::UpdateEntityResponse(parse(payload)?),
            MessageType::RemoveEntity => Self::RemoveEntity(parse(payload)?),
            MessageType::RemoveEntityResponse => Self::RemoveEntityResponse(parse(payload)?),
            MessageType::ControlEntity => Self::ControlEntity(parse(payload)?),
            MessageType::ControlEntityResponse => Self::ControlEntityResponse(parse(payload)?),
            MessageType::RemoveAllEntities => {
                #[derive(Deserialize)]
                struct RemoveAll {
                    kind: EntityKind,
                }
                let RemoveAll { kind } = parse(payload)?;
                Self::RemoveAllEntities { kind }
            }
            MessageType::ErrorResponse => Self::ErrorResponse(parse(payload)?),
        })
    }

    /// Encode this message into a frame carrying the given request id.
    #[must_use]
    pub fn encode(&self, request_id: u32) -> Frame {
        let payload = match self {
            Self::Login(body) => to_payload(body),
            Self::LoginResponse(body) => to_payload(body),
            Self::Auth(body) => to_payload(body),
            Self::AuthResponse => b"{}".to_vec(),
            Self::RegisterViewer(body) | Self::RegisterHandler(body) => to_payload(body),
            Self::RegisterViewerResponse(body) => to_payload(body),
            Self::RegisterHandlerResponse(body) => to_payload(body),
            Self::Ping(body) | Self::Pong(body) => to_payload(body),
            Self::CreateEntity(body)
            | Self::CreateEntityResponse(body)
            | Self::UpdateEntity(body)
            | Self::UpdateEntityResponse(body) => to_payload(body),
            Self::RemoveEntity(body) | Self::RemoveEntityResponse(body) => to_payload(body),
            Self::ControlEntity(body) => to_payload(body),
            Self::ControlEntityResponse(body) => to_payload(body),
            Self::RemoveAllEntities { kind } => {
                #[derive(Serialize)]
                struct RemoveAll {
                    kind: EntityKind,
                }
                to_payload(&RemoveAll { kind: *kind })
            }
            Self::ErrorResponse(body) => to_payload(body),
        };
        Frame {
            message_type: self.message_type() as u16,
            request_id,
            payload: payload.into(),
        }
    }
}

fn parse<'de, T: Deserialize<'de>>(payload: &'de [u8]) -> Option<T> {
    serde_json::from_slice(payload).ok()
}

fn to_payload<T: Serialize>(value: &T) -> Vec<u8> {
    // The message set contains nothing that can fail to serialize.
    serde_json::to_vec(value).expect("message serialization")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_frame() {
        let message = Message::ControlEntity(ControlRequest {
            entity: EntityRef::new(EntityKind::Session, 3),
            command: ControlCommand::StartSimulation,
        });
        let frame = message.encode(42);
        assert_eq!(frame.request_id, 42);
        assert_eq!(Message::decode(&frame), Some(message));
    }

    #[test]
    fn unknown_message_type_decodes_to_none() {
        let frame = Frame {
            message_type: 999,
            request_id: 1,
            payload: b"{}".to_vec().into(),
        };
        assert_eq!(Message::decode(&frame), None);
    }

    #[test]
    fn malformed_payload_decodes_to_none() {
        let frame = Frame {
            message_type: MessageType::Login as u16,
            request_id: 1,
            payload: b"{\"nope\":true}".to_vec().into(),
        };
        assert_eq!(Message::decode(&frame), None);
    }

    #[test]
    fn error_response_names_entity_and_origin() {
        let message = Message::ErrorResponse(ErrorResponse {
            message_type: MessageType::CreateEntity,
            entity: Some(EntityRef::new(EntityKind::MarketOrder, 9)),
            message: "No market handler.".into(),
        });
        let frame = message.encode(7);
        match Message::decode(&frame) {
            Some(Message::ErrorResponse(err)) => {
                assert_eq!(err.message_type, MessageType::CreateEntity);
                assert_eq!(err.message, "No market handler.");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }
}
