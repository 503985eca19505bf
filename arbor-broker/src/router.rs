//! Per-connection role state machine and message dispatch.
//!
//! Frames arrive strictly in order on one connection; each one decodes into
//! a typed [`Message`] that is matched once against the connection's
//! current role. Undecodable payloads are dropped without a response;
//! operations against unknown entities answer with a structured error and
//! leave the connection open.

use std::sync::Arc;

use tracing::debug;

use arbor_core::{
    EntityKind, EntityRef, ItemState, OperatingMode, RunState, SupervisedKind, KEY_SIZE,
};
use arbor_directory::{snapshot, DirectoryError};
use arbor_protocol::{
    ControlCommand, ControlData, ControlRequest, ControlResponse, EntityPayload, ErrorResponse,
    Frame, LoginResponse, Message, MessageType, RegisterHandlerResponse, RegisterRequest,
    RegisterViewerResponse,
};

use crate::registry::ConnId;
use crate::shared::{
    directory_error_message, market_payload, session_payload, BrokerShared, EntityKey,
};

/// Role of one connection, driving its dispatch table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Unauthenticated,
    AwaitingAuth,
    User,
    MarketViewer,
    SessionViewer,
    MarketHandler,
    BotHandler,
}

/// State machine for one accepted socket.
pub struct Connection {
    id: ConnId,
    role: Role,
    /// Process registration is only honored from loopback peers.
    trusted: bool,
    shared: Arc<BrokerShared>,
    user: Option<String>,
    challenge: Option<[u8; KEY_SIZE]>,
    /// Market this connection views or handles (owner, entity).
    market: Option<EntityKey>,
    /// Session this connection views or handles.
    session: Option<EntityKey>,
}

impl Connection {
    #[must_use]
    pub fn new(shared: Arc<BrokerShared>, id: ConnId, trusted: bool) -> Self {
        Self {
            id,
            role: Role::Unauthenticated,
            trusted,
            shared,
            user: None,
            challenge: None,
            market: None,
            session: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Dispatch one inbound frame. Frame-level violations were already
    /// rejected by the codec; everything here is at worst a request error.
    pub async fn on_frame(&mut self, frame: Frame) {
        let Some(message) = Message::decode(&frame) else {
            debug!(conn = self.id, message_type = frame.message_type, "dropping undecodable frame");
            return;
        };
        let request_id = frame.request_id;

        // Ping is answered in every role.
        if let Message::Ping(payload) = &message {
            self.respond(request_id, &Message::Pong(payload.clone()));
            return;
        }

        match self.role {
            Role::Unauthenticated => self.on_unauthenticated(request_id, message).await,
            Role::AwaitingAuth => self.on_awaiting_auth(request_id, message),
            Role::User => self.on_user(request_id, message).await,
            Role::SessionViewer => self.on_session_viewer(request_id, message).await,
            Role::MarketViewer => self.on_market_viewer(request_id, message).await,
            Role::MarketHandler | Role::BotHandler => self.on_handler(request_id, message).await,
        }
    }

    /// Tear down every binding this connection holds.
    pub fn close(&mut self) {
        self.shared.disconnect(self.id);
    }

    // --- helpers -----------------------------------------------------------

    fn respond(&self, request_id: u32, message: &Message) {
        self.shared.send(self.id, message, request_id);
    }

    fn error(
        &self,
        request_id: u32,
        origin: MessageType,
        entity: Option<EntityRef>,
        message: impl Into<String>,
    ) {
        self.respond(
            request_id,
            &Message::ErrorResponse(ErrorResponse {
                message_type: origin,
                entity,
                message: message.into(),
            }),
        );
    }

    fn directory_error(
        &self,
        request_id: u32,
        origin: MessageType,
        entity: Option<EntityRef>,
        err: &DirectoryError,
    ) {
        self.error(request_id, origin, entity, directory_error_message(err));
    }

    fn user_name(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    // --- unauthenticated ----------------------------------------------------

    async fn on_unauthenticated(&mut self, request_id: u32, message: Message) {
        match message {
            Message::Login(login) => self.handle_login(request_id, &login.user_name),
            Message::RegisterViewer(register) if self.trusted => {
                self.handle_register_viewer(request_id, register);
            }
            Message::RegisterHandler(register) if self.trusted => {
                self.handle_register_handler(request_id, register).await;
            }
            other => debug!(conn = self.id, ?other, "dropped in unauthenticated state"),
        }
    }

    fn handle_login(&mut self, request_id: u32, user_name: &str) {
        let user_key = self.shared.with_state(|state| {
            state
                .directory_ref()
                .user(user_name)
                .map(|user| user.key)
                .ok()
        });
        let Some(user_key) = user_key else {
            self.error(request_id, MessageType::Login, None, "Unknown user.");
            return;
        };
        let challenge = crate::auth::challenge();
        self.challenge = Some(challenge);
        self.user = Some(user_name.to_string());
        self.role = Role::AwaitingAuth;
        self.respond(
            request_id,
            &Message::LoginResponse(LoginResponse { user_key, challenge }),
        );
    }

    fn on_awaiting_auth(&mut self, request_id: u32, message: Message) {
        let Message::Auth(auth) = message else {
            debug!(conn = self.id, "dropped non-auth frame while awaiting auth");
            return;
        };
        let (Some(challenge), Some(user_name)) = (self.challenge.take(), self.user.clone()) else {
            return;
        };
        let secret = self.shared.with_state(|state| {
            state
                .directory_ref()
                .user(&user_name)
                .map(|user| user.secret)
                .ok()
        });
        let verified = secret
            .map(|secret| crate::auth::verify(&challenge, &secret, &auth.signature))
            .unwrap_or(false);
        if !verified {
            self.error(request_id, MessageType::Auth, None, "Incorrect signature.");
            self.role = Role::Unauthenticated;
            self.user = None;
            return;
        }

        self.role = Role::User;
        self.shared.bind_user_conn(self.id, &user_name);
        self.respond(request_id, &Message::AuthResponse);

        // Stream the full directory snapshot: catalogs first, then the
        // user's own markets and sessions.
        let snapshot_frames = self.shared.with_state(|state| {
            let directory = state.directory_ref();
            let mut messages = Vec::new();
            for engine in directory.engines() {
                messages.push(Message::UpdateEntity(EntityPayload::BotEngine(engine.clone())));
            }
            for adapter in directory.adapters() {
                messages.push(Message::UpdateEntity(EntityPayload::MarketAdapter(
                    adapter.clone(),
                )));
            }
            if let Ok(user) = directory.user(&user_name) {
                for market in user.markets.values() {
                    messages.push(Message::UpdateEntity(market_payload(market)));
                }
                for session in user.sessions.values() {
                    messages.push(Message::UpdateEntity(session_payload(session)));
                }
            }
            messages
        });
        for message in snapshot_frames {
            self.respond(0, &message);
        }
    }

    // --- process registration ----------------------------------------------

    fn handle_register_viewer(&mut self, request_id: u32, register: RegisterRequest) {
        match register.kind {
            SupervisedKind::Session => {
                let found = self.shared.with_state(|state| {
                    state
                        .directory_ref()
                        .find_session_by_pid(register.pid)
                        .map(|(user, session)| (user.to_string(), session.id, session.market_id))
                });
                let Some((owner, session_id, market_id)) = found else {
                    self.error(
                        request_id,
                        MessageType::RegisterViewer,
                        None,
                        "Unknown session.",
                    );
                    return;
                };
                let key = EntityKey::new(owner.clone(), EntityKind::Session, session_id);
                self.shared.add_viewer(self.id, key.clone());
                self.session = Some(key.clone());
                self.role = Role::SessionViewer;
                self.respond(
                    request_id,
                    &Message::RegisterViewerResponse(RegisterViewerResponse {
                        session_id: Some(session_id),
                        market_id: Some(market_id),
                    }),
                );
                self.shared.broadcast_entity(&key, None);
            }
            SupervisedKind::Market => {
                let found = self.shared.with_state(|state| {
                    state
                        .directory_ref()
                        .find_market_by_pid(register.pid)
                        .map(|(user, market)| (user.to_string(), market.id))
                });
                let Some((owner, market_id)) = found else {
                    self.error(
                        request_id,
                        MessageType::RegisterViewer,
                        None,
                        "Unknown market.",
                    );
                    return;
                };
                let key = EntityKey::new(owner, EntityKind::Market, market_id);
                self.shared.add_viewer(self.id, key.clone());
                self.market = Some(key);
                self.role = Role::MarketViewer;
                self.respond(
                    request_id,
                    &Message::RegisterViewerResponse(RegisterViewerResponse {
                        session_id: None,
                        market_id: Some(market_id),
                    }),
                );
            }
        }
    }

    async fn handle_register_handler(&mut self, request_id: u32, register: RegisterRequest) {
        match register.kind {
            SupervisedKind::Session => {
                let found = self.shared.with_state(|state| {
                    let directory = state.directory_ref();
                    let (user, session) = directory.find_session_by_pid(register.pid)?;
                    let market = directory.market(user, session.market_id).ok()?;
                    let adapter = directory.adapter(market.adapter_id).ok()?;
                    Some((
                        user.to_string(),
                        session.id,
                        adapter.name.clone(),
                        adapter.currency_base.clone(),
                        adapter.currency_comm.clone(),
                        session.mode == OperatingMode::Simulation,
                    ))
                });
                let Some((owner, session_id, adapter, base, comm, simulation)) = found else {
                    self.error(
                        request_id,
                        MessageType::RegisterHandler,
                        None,
                        "Unknown session.",
                    );
                    return;
                };
                let key = EntityKey::new(owner.clone(), EntityKind::Session, session_id);
                if !self.shared.bind_handler(self.id, key.clone()) {
                    self.error(
                        request_id,
                        MessageType::RegisterHandler,
                        None,
                        "Invalid session.",
                    );
                    return;
                }
                self.session = Some(key.clone());
                self.role = Role::BotHandler;
                self.respond(
                    request_id,
                    &Message::RegisterHandlerResponse(RegisterHandlerResponse::Bot {
                        market_adapter: adapter,
                        currency_base: base,
                        currency_comm: comm,
                        simulation,
                    }),
                );
                // The supervisor proved the process exists; a live handler
                // speaking the protocol is what makes it running.
                self.shared
                    .apply_run_state(&owner, SupervisedKind::Session, session_id, RunState::Running)
                    .await;
            }
            SupervisedKind::Market => {
                let found = self.shared.with_state(|state| {
                    state
                        .directory_ref()
                        .find_market_by_pid(register.pid)
                        .map(|(user, market)| {
                            (
                                user.to_string(),
                                market.id,
                                market.venue_user_name.clone(),
                                market.api_key.clone(),
                                market.api_secret.clone(),
                            )
                        })
                });
                let Some((owner, market_id, venue_user, api_key, api_secret)) = found else {
                    self.error(
                        request_id,
                        MessageType::RegisterHandler,
                        None,
                        "Unknown market.",
                    );
                    return;
                };
                let key = EntityKey::new(owner.clone(), EntityKind::Market, market_id);
                if !self.shared.bind_handler(self.id, key.clone()) {
                    self.error(
                        request_id,
                        MessageType::RegisterHandler,
                        None,
                        "Invalid market.",
                    );
                    return;
                }
                self.market = Some(key.clone());
                self.role = Role::MarketHandler;
                self.respond(
                    request_id,
                    &Message::RegisterHandlerResponse(RegisterHandlerResponse::Market {
                        venue_user_name: venue_user,
                        api_key,
                        api_secret,
                    }),
                );
                self.shared
                    .apply_run_state(&owner, SupervisedKind::Market, market_id, RunState::Running)
                    .await;
                // Prime the fresh handler with a balance refresh.
                self.respond(
                    0,
                    &Message::ControlEntity(ControlRequest {
                        entity: EntityRef::new(EntityKind::Market, market_id),
                        command: ControlCommand::RefreshBalance,
                    }),
                );
            }
        }
    }

    // --- user role ----------------------------------------------------------

    async fn on_user(&mut self, request_id: u32, message: Message) {
        match message {
            Message::CreateEntity(payload) => self.on_user_create(request_id, payload).await,
            Message::UpdateEntity(payload) => self.on_user_update(request_id, payload).await,
            Message::RemoveEntity(entity) => self.on_user_remove(request_id, entity).await,
            Message::ControlEntity(control) => self.on_user_control(request_id, control).await,
            other => debug!(conn = self.id, ?other, "dropped in user state"),
        }
    }

    async fn on_user_create(&mut self, request_id: u32, payload: EntityPayload) {
        let origin = MessageType::CreateEntity;
        match payload {
            EntityPayload::Market(info) => {
                let user = self.user_name().to_string();
                let created = self.shared.with_state(|state| {
                    state
                        .directory()
                        .create_market(
                            &user,
                            info.adapter_id,
                            info.venue_user_name.clone(),
                            info.api_key.clone(),
                            info.api_secret.clone(),
                        )
                        .map(market_payload)
                });
                match created {
                    Ok(response) => {
                        let market_id = response.id();
                        self.respond(request_id, &Message::CreateEntityResponse(response.clone()));
                        self.shared.broadcast_user(
                            &user,
                            &Message::UpdateEntity(response),
                            Some(self.id),
                        );
                        let key = EntityKey::new(user.clone(), EntityKind::Market, market_id);
                        self.shared.persist(&key).await;
                        // A fresh market wants its adapter process running.
                        self.shared
                            .apply_run_state(&user, SupervisedKind::Market, market_id, RunState::Starting)
                            .await;
                    }
                    Err(err) => self.directory_error(request_id, origin, None, &err),
                }
            }
            EntityPayload::Session(info) => {
                let user = self.user_name().to_string();
                let created = self.shared.with_state(|state| {
                    state
                        .directory()
                        .create_session(
                            &user,
                            info.name.clone(),
                            info.engine_id,
                            info.market_id,
                            info.balance.available_base,
                            info.balance.available_comm,
                        )
                        .map(session_payload)
                });
                match created {
                    Ok(response) => {
                        let session_id = response.id();
                        self.respond(request_id, &Message::CreateEntityResponse(response.clone()));
                        self.shared.broadcast_user(
                            &user,
                            &Message::UpdateEntity(response),
                            Some(self.id),
                        );
                        self.shared
                            .persist(&EntityKey::new(user, EntityKind::Session, session_id))
                            .await;
                    }
                    Err(err) => self.directory_error(request_id, origin, None, &err),
                }
            }
            EntityPayload::MarketOrder(order) => {
                self.proxy_to_market_handler(
                    request_id,
                    origin,
                    Some(EntityRef::new(EntityKind::MarketOrder, order.id)),
                    Message::CreateEntity(EntityPayload::MarketOrder(order)),
                );
            }
            EntityPayload::SessionItem(mut item) => {
                let Some(session_key) = self.session.clone() else {
                    self.error(request_id, origin, None, "Invalid session.");
                    return;
                };
                // Server-assigned fields are never taken from the caller.
                item.state = ItemState::initial_for(item.side);
                item.price = Default::default();
                item.profitable_price = Default::default();
                item.order_id = None;
                if let Some(handler) = self.shared.handler_of(&session_key) {
                    self.proxy(
                        request_id,
                        handler,
                        origin,
                        Some(EntityRef::new(EntityKind::SessionItem, item.id)),
                        &Message::CreateEntity(EntityPayload::SessionItem(item)),
                    );
                } else {
                    let created = self.shared.with_state(|state| {
                        state
                            .directory()
                            .create_session_item(&session_key.user, session_key.entity.id, item)
                    });
                    self.apply_result(
                        request_id,
                        origin,
                        &session_key,
                        created.map(EntityPayload::SessionItem),
                    )
                    .await;
                }
            }
            other => debug!(conn = self.id, kind = %other.kind(), "unhandled user create"),
        }
    }

    async fn on_user_update(&mut self, request_id: u32, payload: EntityPayload) {
        let origin = MessageType::UpdateEntity;
        match payload {
            EntityPayload::MarketOrder(order) => {
                self.proxy_to_market_handler(
                    request_id,
                    origin,
                    Some(EntityRef::new(EntityKind::MarketOrder, order.id)),
                    Message::UpdateEntity(EntityPayload::MarketOrder(order)),
                );
            }
            EntityPayload::SessionItem(item) => {
                let Some(session_key) = self.session.clone() else {
                    self.error(request_id, origin, None, "Invalid session.");
                    return;
                };
                // Only the flip price is user-editable.
                let current = self.shared.with_state(|state| {
                    state
                        .directory_ref()
                        .session(&session_key.user, session_key.entity.id)
                        .ok()
                        .and_then(|session| session.ledger().items.get(&item.id).cloned())
                });
                let Some(mut updated) = current else {
                    self.error(
                        request_id,
                        origin,
                        Some(EntityRef::new(EntityKind::SessionItem, item.id)),
                        "Unknown session item.",
                    );
                    return;
                };
                updated.flip_price = item.flip_price;
                if let Some(handler) = self.shared.handler_of(&session_key) {
                    self.proxy(
                        request_id,
                        handler,
                        origin,
                        Some(EntityRef::new(EntityKind::SessionItem, updated.id)),
                        &Message::UpdateEntity(EntityPayload::SessionItem(updated)),
                    );
                } else {
                    let applied = self.shared.with_state(|state| {
                        state.directory().update_session_item(
                            &session_key.user,
                            session_key.entity.id,
                            updated,
                        )
                    });
                    self.apply_result(
                        request_id,
                        origin,
                        &session_key,
                        applied.map(EntityPayload::SessionItem),
                    )
                    .await;
                }
            }
            EntityPayload::SessionProperty(property) => {
                let Some(session_key) = self.session.clone() else {
                    self.error(request_id, origin, None, "Invalid session.");
                    return;
                };
                let entity = EntityRef::new(EntityKind::SessionProperty, property.id);
                // Read-only enforcement happens before any proxying.
                let current = self.shared.with_state(|state| {
                    state
                        .directory_ref()
                        .session(&session_key.user, session_key.entity.id)
                        .ok()
                        .and_then(|session| session.ledger().properties.get(&property.id).cloned())
                });
                let Some(mut updated) = current else {
                    self.error(request_id, origin, Some(entity), "Unknown session property.");
                    return;
                };
                if updated.read_only {
                    self.error(request_id, origin, Some(entity), "Property is not editable.");
                    return;
                }
                updated.value = property.value;
                if let Some(handler) = self.shared.handler_of(&session_key) {
                    self.proxy(
                        request_id,
                        handler,
                        origin,
                        Some(entity),
                        &Message::UpdateEntity(EntityPayload::SessionProperty(updated)),
                    );
                } else {
                    let applied = self.shared.with_state(|state| {
                        state.directory().update_session_property_value(
                            &session_key.user,
                            session_key.entity.id,
                            updated.id,
                            updated.value.clone(),
                        )
                    });
                    self.apply_result(
                        request_id,
                        origin,
                        &session_key,
                        applied.map(EntityPayload::SessionProperty),
                    )
                    .await;
                }
            }
            other => debug!(conn = self.id, kind = %other.kind(), "unhandled user update"),
        }
    }

    async fn on_user_remove(&mut self, request_id: u32, entity: EntityRef) {
        let origin = MessageType::RemoveEntity;
        let user = self.user_name().to_string();
        match entity.kind {
            EntityKind::Market => {
                let removed = self
                    .shared
                    .with_state(|state| state.directory().remove_market(&user, entity.id));
                match removed {
                    Ok(_) => {
                        self.respond(request_id, &Message::RemoveEntityResponse(entity));
                        self.shared.broadcast_user(
                            &user,
                            &Message::RemoveEntity(entity),
                            Some(self.id),
                        );
                        self.shared
                            .persist_removal(&EntityKey::new(user, EntityKind::Market, entity.id))
                            .await;
                    }
                    Err(err) => self.directory_error(request_id, origin, Some(entity), &err),
                }
            }
            EntityKind::Session => {
                let removed = self
                    .shared
                    .with_state(|state| state.directory().remove_session(&user, entity.id));
                match removed {
                    Ok(_) => {
                        self.respond(request_id, &Message::RemoveEntityResponse(entity));
                        self.shared.broadcast_user(
                            &user,
                            &Message::RemoveEntity(entity),
                            Some(self.id),
                        );
                        self.shared
                            .persist_removal(&EntityKey::new(user, EntityKind::Session, entity.id))
                            .await;
                    }
                    Err(err) => self.directory_error(request_id, origin, Some(entity), &err),
                }
            }
            EntityKind::MarketOrder => {
                self.proxy_to_market_handler(
                    request_id,
                    origin,
                    Some(entity),
                    Message::RemoveEntity(entity),
                );
            }
            EntityKind::SessionItem => {
                let Some(session_key) = self.session.clone() else {
                    self.error(request_id, origin, Some(entity), "Invalid session.");
                    return;
                };
                if let Some(handler) = self.shared.handler_of(&session_key) {
                    self.proxy(
                        request_id,
                        handler,
                        origin,
                        Some(entity),
                        &Message::RemoveEntity(entity),
                    );
                } else {
                    let removed = self.shared.with_state(|state| {
                        state.directory().remove_session_item(
                            &session_key.user,
                            session_key.entity.id,
                            entity.id,
                        )
                    });
                    match removed {
                        Ok(()) => {
                            self.respond(request_id, &Message::RemoveEntityResponse(entity));
                            self.shared.broadcast_viewers(
                                &session_key,
                                &Message::RemoveEntity(entity),
                                Some(self.id),
                            );
                            self.shared.persist(&session_key).await;
                        }
                        Err(err) => self.directory_error(request_id, origin, Some(entity), &err),
                    }
                }
            }
            _ => debug!(conn = self.id, kind = %entity.kind, "unhandled user remove"),
        }
    }

    async fn on_user_control(&mut self, request_id: u32, control: ControlRequest) {
        let origin = MessageType::ControlEntity;
        let user = self.user_name().to_string();
        let entity = control.entity;
        match entity.kind {
            EntityKind::Session => {
                let exists = self
                    .shared
                    .with_state(|state| state.directory_ref().session(&user, entity.id).is_ok());
                if !exists {
                    self.error(request_id, origin, Some(entity), "Unknown session.");
                    return;
                }
                let key = EntityKey::new(user.clone(), EntityKind::Session, entity.id);
                match control.command {
                    ControlCommand::Select => {
                        if let Some(previous) = self.session.take() {
                            self.shared.remove_viewer(self.id, &previous);
                        }
                        self.shared.add_viewer(self.id, key.clone());
                        self.session = Some(key.clone());
                        self.ack_control(request_id, control);
                        self.replay_session(&key);
                    }
                    ControlCommand::StartSimulation | ControlCommand::StartLive => {
                        let attached = self.shared.handler_attached(&key);
                        let switched = self.shared.with_state(|state| {
                            let session =
                                state.directory().session_mut(&user, entity.id)?;
                            if control.command == ControlCommand::StartSimulation {
                                snapshot::enter_simulation(session, attached)?;
                            } else {
                                snapshot::enter_live(session, attached)?;
                            }
                            session.run_state = RunState::Starting;
                            Ok::<(), DirectoryError>(())
                        });
                        match switched {
                            Ok(()) => {
                                self.ack_control(request_id, control);
                                self.shared.broadcast_entity(&key, None);
                                self.resync_session_viewers(&key);
                                self.shared.persist(&key).await;
                            }
                            Err(err) => {
                                self.directory_error(request_id, origin, Some(entity), &err);
                            }
                        }
                    }
                    ControlCommand::Stop => {
                        self.shared.with_state(|state| {
                            if let Ok(session) = state.directory().session_mut(&user, entity.id) {
                                session.run_state = RunState::Stopping;
                            }
                        });
                        self.ack_control(request_id, control);
                        self.shared.broadcast_entity(&key, None);
                        self.shared.persist(&key).await;
                    }
                    _ => debug!(conn = self.id, ?control, "unhandled session control"),
                }
            }
            EntityKind::Market => {
                let exists = self
                    .shared
                    .with_state(|state| state.directory_ref().market(&user, entity.id).is_ok());
                if !exists {
                    self.error(request_id, origin, Some(entity), "Unknown market.");
                    return;
                }
                let key = EntityKey::new(user.clone(), EntityKind::Market, entity.id);
                match control.command {
                    ControlCommand::Select => {
                        if let Some(previous) = self.market.take() {
                            self.shared.remove_viewer(self.id, &previous);
                        }
                        self.shared.add_viewer(self.id, key.clone());
                        self.market = Some(key.clone());
                        self.ack_control(request_id, control);
                        self.replay_market(&key);
                    }
                    ControlCommand::RefreshBalance
                    | ControlCommand::RefreshTransactions
                    | ControlCommand::RefreshOrders => {
                        let Some(handler) = self.shared.handler_of(&key) else {
                            self.error(request_id, origin, Some(entity), "No market handler.");
                            return;
                        };
                        self.proxy(
                            request_id,
                            handler,
                            origin,
                            Some(entity),
                            &Message::ControlEntity(control),
                        );
                    }
                    _ => debug!(conn = self.id, ?control, "unhandled market control"),
                }
            }
            _ => debug!(conn = self.id, kind = %entity.kind, "unhandled control target"),
        }
    }

    // --- session viewer (bot process) ---------------------------------------

    async fn on_session_viewer(&mut self, request_id: u32, message: Message) {
        let Some(session_key) = self.session.clone() else {
            return;
        };
        match message {
            Message::CreateEntity(payload) => {
                self.on_bot_create(request_id, &session_key, payload).await;
            }
            Message::UpdateEntity(payload) => {
                self.on_bot_update(request_id, &session_key, payload).await;
            }
            Message::RemoveEntity(entity) => {
                self.on_bot_remove(request_id, &session_key, entity).await;
            }
            Message::ControlEntity(control) => {
                self.on_bot_control(request_id, &session_key, control);
            }
            other => debug!(conn = self.id, ?other, "dropped in session viewer state"),
        }
    }

    async fn on_bot_create(
        &mut self,
        request_id: u32,
        session_key: &EntityKey,
        payload: EntityPayload,
    ) {
        let origin = MessageType::CreateEntity;
        let user = session_key.user.clone();
        let session_id = session_key.entity.id;
        let result = match payload {
            EntityPayload::SessionTransaction(tx) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .create_session_transaction(&user, session_id, tx)
                })
                .map(EntityPayload::SessionTransaction),
            EntityPayload::SessionItem(item) => self
                .shared
                .with_state(|state| state.directory().create_session_item(&user, session_id, item))
                .map(EntityPayload::SessionItem),
            EntityPayload::SessionProperty(property) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .upsert_session_property(&user, session_id, property)
                })
                .map(EntityPayload::SessionProperty),
            EntityPayload::SessionOrder(order) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .create_session_order(&user, session_id, order)
                })
                .map(EntityPayload::SessionOrder),
            EntityPayload::SessionMarker(marker) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .create_session_marker(&user, session_id, marker)
                })
                .map(EntityPayload::SessionMarker),
            EntityPayload::SessionLogEntry(entry) => self
                .shared
                .with_state(|state| state.directory().append_session_log(&user, session_id, entry))
                .map(EntityPayload::SessionLogEntry),
            EntityPayload::MarketOrder(order) => {
                self.proxy_to_session_market_handler(
                    request_id,
                    session_key,
                    origin,
                    Some(EntityRef::new(EntityKind::MarketOrder, order.id)),
                    Message::CreateEntity(EntityPayload::MarketOrder(order)),
                );
                return;
            }
            other => {
                debug!(conn = self.id, kind = %other.kind(), "unhandled bot create");
                return;
            }
        };
        self.apply_result(request_id, origin, session_key, result).await;
    }

    async fn on_bot_update(
        &mut self,
        request_id: u32,
        session_key: &EntityKey,
        payload: EntityPayload,
    ) {
        let origin = MessageType::UpdateEntity;
        let user = session_key.user.clone();
        let session_id = session_key.entity.id;
        let result = match payload {
            EntityPayload::SessionTransaction(tx) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .update_session_transaction(&user, session_id, tx)
                })
                .map(EntityPayload::SessionTransaction),
            EntityPayload::SessionItem(item) => self
                .shared
                .with_state(|state| state.directory().update_session_item(&user, session_id, item))
                .map(EntityPayload::SessionItem),
            EntityPayload::SessionProperty(property) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .upsert_session_property(&user, session_id, property)
                })
                .map(EntityPayload::SessionProperty),
            EntityPayload::SessionOrder(order) => self
                .shared
                .with_state(|state| {
                    state
                        .directory()
                        .upsert_session_order(&user, session_id, order)
                })
                .map(EntityPayload::SessionOrder),
            EntityPayload::MarketBalance(balance) => {
                // Bots keep their session balance current.
                let applied = self.shared.with_state(|state| {
                    state
                        .directory()
                        .set_session_balance(&user, session_id, balance.clone())
                });
                applied.map(|()| EntityPayload::MarketBalance(balance))
            }
            other => {
                debug!(conn = self.id, kind = %other.kind(), "unhandled bot update");
                return;
            }
        };
        self.apply_result(request_id, origin, session_key, result).await;
    }

    async fn on_bot_remove(&mut self, request_id: u32, session_key: &EntityKey, entity: EntityRef) {
        let origin = MessageType::RemoveEntity;
        let user = session_key.user.clone();
        let session_id = session_key.entity.id;
        let removed = match entity.kind {
            EntityKind::SessionTransaction => self.shared.with_state(|state| {
                state
                    .directory()
                    .remove_session_transaction(&user, session_id, entity.id)
            }),
            EntityKind::SessionItem => self.shared.with_state(|state| {
                state
                    .directory()
                    .remove_session_item(&user, session_id, entity.id)
            }),
            EntityKind::SessionProperty => self.shared.with_state(|state| {
                state
                    .directory()
                    .remove_session_property(&user, session_id, entity.id)
            }),
            EntityKind::SessionOrder => self.shared.with_state(|state| {
                state
                    .directory()
                    .remove_session_order(&user, session_id, entity.id)
            }),
            EntityKind::MarketOrder => {
                self.proxy_to_session_market_handler(
                    request_id,
                    session_key,
                    origin,
                    Some(entity),
                    Message::RemoveEntity(entity),
                );
                return;
            }
            _ => {
                debug!(conn = self.id, kind = %entity.kind, "unhandled bot remove");
                return;
            }
        };
        match removed {
            Ok(()) => {
                self.respond(request_id, &Message::RemoveEntityResponse(entity));
                self.shared.broadcast_viewers(
                    session_key,
                    &Message::RemoveEntity(entity),
                    Some(self.id),
                );
                self.shared.persist(session_key).await;
            }
            Err(err) => self.directory_error(request_id, origin, Some(entity), &err),
        }
    }

    fn on_bot_control(&mut self, request_id: u32, session_key: &EntityKey, control: ControlRequest) {
        let origin = MessageType::ControlEntity;
        let entity = control.entity;
        match entity.kind {
            EntityKind::Session => {
                if entity.id != session_key.entity.id {
                    self.error(request_id, origin, Some(entity), "Unknown session.");
                    return;
                }
                let data = self.shared.with_state(|state| {
                    let session = state
                        .directory_ref()
                        .session(&session_key.user, session_key.entity.id)
                        .ok()?;
                    let ledger = session.ledger();
                    Some(match control.command {
                        ControlCommand::RequestTransactions => {
                            ControlData::Transactions(ledger.transactions.values().cloned().collect())
                        }
                        ControlCommand::RequestItems => {
                            ControlData::Items(ledger.items.values().cloned().collect())
                        }
                        ControlCommand::RequestProperties => {
                            ControlData::Properties(ledger.properties.values().cloned().collect())
                        }
                        ControlCommand::RequestOrders => {
                            ControlData::Orders(ledger.orders.values().cloned().collect())
                        }
                        _ => return None,
                    })
                });
                match data {
                    Some(data) => self.respond(
                        request_id,
                        &Message::ControlEntityResponse(ControlResponse {
                            entity,
                            command: control.command,
                            data,
                        }),
                    ),
                    None => debug!(conn = self.id, ?control, "unhandled bot session control"),
                }
            }
            EntityKind::Market => {
                let market_id = self.shared.with_state(|state| {
                    state
                        .directory_ref()
                        .session(&session_key.user, session_key.entity.id)
                        .map(|session| session.market_id)
                        .ok()
                });
                if market_id != Some(entity.id) {
                    self.error(request_id, origin, Some(entity), "Unknown market.");
                    return;
                }
                match control.command {
                    ControlCommand::RequestBalance
                    | ControlCommand::RequestTransactions
                    | ControlCommand::RequestOrders => {
                        self.proxy_to_session_market_handler(
                            request_id,
                            session_key,
                            origin,
                            Some(entity),
                            Message::ControlEntity(control),
                        );
                    }
                    _ => debug!(conn = self.id, ?control, "unhandled bot market control"),
                }
            }
            _ => debug!(conn = self.id, kind = %entity.kind, "unhandled bot control target"),
        }
    }

    // --- market viewer (adapter process) ------------------------------------

    async fn on_market_viewer(&mut self, request_id: u32, message: Message) {
        let Some(market_key) = self.market.clone() else {
            return;
        };
        let user = market_key.user.clone();
        let market_id = market_key.entity.id;
        match message {
            Message::UpdateEntity(payload) => {
                let origin = MessageType::UpdateEntity;
                let result = match payload {
                    EntityPayload::MarketTransaction(tx) => self
                        .shared
                        .with_state(|state| {
                            state
                                .directory()
                                .upsert_market_transaction(&user, market_id, tx)
                        })
                        .map(EntityPayload::MarketTransaction),
                    EntityPayload::MarketOrder(order) => self
                        .shared
                        .with_state(|state| {
                            state.directory().upsert_market_order(&user, market_id, order)
                        })
                        .map(EntityPayload::MarketOrder),
                    EntityPayload::MarketBalance(balance) => self
                        .shared
                        .with_state(|state| {
                            state
                                .directory()
                                .set_market_balance(&user, market_id, balance.clone())
                        })
                        .map(|()| EntityPayload::MarketBalance(balance)),
                    other => {
                        debug!(conn = self.id, kind = %other.kind(), "unhandled adapter update");
                        return;
                    }
                };
                self.apply_result(request_id, origin, &market_key, result).await;
            }
            Message::RemoveEntity(entity) => {
                let origin = MessageType::RemoveEntity;
                let removed = match entity.kind {
                    EntityKind::MarketTransaction => self.shared.with_state(|state| {
                        state
                            .directory()
                            .remove_market_transaction(&user, market_id, entity.id)
                    }),
                    EntityKind::MarketOrder => self.shared.with_state(|state| {
                        state
                            .directory()
                            .remove_market_order(&user, market_id, entity.id)
                    }),
                    _ => {
                        debug!(conn = self.id, kind = %entity.kind, "unhandled adapter remove");
                        return;
                    }
                };
                match removed {
                    Ok(()) => {
                        self.respond(request_id, &Message::RemoveEntityResponse(entity));
                        self.shared.broadcast_viewers(
                            &market_key,
                            &Message::RemoveEntity(entity),
                            Some(self.id),
                        );
                        self.shared.persist(&market_key).await;
                    }
                    Err(err) => self.directory_error(request_id, origin, Some(entity), &err),
                }
            }
            other => debug!(conn = self.id, ?other, "dropped in market viewer state"),
        }
    }

    // --- handler roles -------------------------------------------------------

    async fn on_handler(&mut self, request_id: u32, message: Message) {
        // Unsolicited frames (request id zero) carry no correlation.
        if request_id == 0 {
            debug!(conn = self.id, "dropping unsolicited handler frame");
            return;
        }
        let relayable = matches!(
            message,
            Message::CreateEntityResponse(_)
                | Message::UpdateEntityResponse(_)
                | Message::RemoveEntityResponse(_)
                | Message::ControlEntityResponse(_)
                | Message::ErrorResponse(_)
        );
        if !relayable {
            debug!(conn = self.id, ?message, "dropped in handler state");
            return;
        }
        let Some(entry) = self.shared.resolve(request_id) else {
            debug!(conn = self.id, correlation = request_id, "late or unknown correlation");
            return;
        };
        self.shared
            .send(entry.requester, &message, entry.requester_request_id);

        // Fold the authoritative result back into the directory and fan it
        // out to the other viewers of the handled entity.
        let key = match self.role {
            Role::MarketHandler => self.market.clone(),
            _ => self.session.clone(),
        };
        let Some(key) = key else { return };
        match &message {
            Message::CreateEntityResponse(payload) | Message::UpdateEntityResponse(payload) => {
                let applied = self.apply_handler_payload(&key, payload);
                if applied {
                    self.shared.broadcast_viewers(
                        &key,
                        &Message::UpdateEntity(payload.clone()),
                        Some(entry.requester),
                    );
                    self.shared.persist(&key).await;
                }
            }
            Message::RemoveEntityResponse(entity) => {
                let removed = self.shared.with_state(|state| {
                    let directory = state.directory();
                    match entity.kind {
                        EntityKind::MarketOrder => directory
                            .remove_market_order(&key.user, key.entity.id, entity.id)
                            .is_ok(),
                        EntityKind::MarketTransaction => directory
                            .remove_market_transaction(&key.user, key.entity.id, entity.id)
                            .is_ok(),
                        EntityKind::SessionItem => directory
                            .remove_session_item(&key.user, key.entity.id, entity.id)
                            .is_ok(),
                        EntityKind::SessionOrder => directory
                            .remove_session_order(&key.user, key.entity.id, entity.id)
                            .is_ok(),
                        _ => false,
                    }
                });
                if removed {
                    self.shared.broadcast_viewers(
                        &key,
                        &Message::RemoveEntity(*entity),
                        Some(entry.requester),
                    );
                    self.shared.persist(&key).await;
                }
            }
            _ => {}
        }
    }

    fn apply_handler_payload(&self, key: &EntityKey, payload: &EntityPayload) -> bool {
        let user = key.user.clone();
        let id = key.entity.id;
        self.shared.with_state(|state| {
            let directory = state.directory();
            match payload {
                EntityPayload::MarketOrder(order) => directory
                    .upsert_market_order(&user, id, order.clone())
                    .is_ok(),
                EntityPayload::MarketTransaction(tx) => directory
                    .upsert_market_transaction(&user, id, tx.clone())
                    .is_ok(),
                EntityPayload::MarketBalance(balance) => directory
                    .set_market_balance(&user, id, balance.clone())
                    .is_ok(),
                EntityPayload::SessionItem(item) => directory
                    .upsert_session_item(&user, id, item.clone())
                    .is_ok(),
                EntityPayload::SessionTransaction(tx) => directory
                    .upsert_session_transaction(&user, id, tx.clone())
                    .is_ok(),
                EntityPayload::SessionProperty(property) => directory
                    .upsert_session_property(&user, id, property.clone())
                    .is_ok(),
                EntityPayload::SessionOrder(order) => directory
                    .upsert_session_order(&user, id, order.clone())
                    .is_ok(),
                _ => false,
            }
        })
    }

    // --- shared plumbing -----------------------------------------------------

    /// Ack-or-error plus fan-out and persistence for a direct mutation.
    async fn apply_result(
        &self,
        request_id: u32,
        origin: MessageType,
        key: &EntityKey,
        result: Result<EntityPayload, DirectoryError>,
    ) {
        match result {
            Ok(payload) => {
                let response = match origin {
                    MessageType::CreateEntity => Message::CreateEntityResponse(payload.clone()),
                    _ => Message::UpdateEntityResponse(payload.clone()),
                };
                self.respond(request_id, &response);
                self.shared.broadcast_viewers(
                    key,
                    &Message::UpdateEntity(payload),
                    Some(self.id),
                );
                self.shared.persist(key).await;
            }
            Err(err) => self.directory_error(request_id, origin, None, &err),
        }
    }

    /// Forward a request to a handler connection under a fresh correlation
    /// id and arm the proxy timeout. The caller's task is free immediately;
    /// the correlation id is the only linkage to the eventual response.
    fn proxy(
        &self,
        request_id: u32,
        responder: ConnId,
        origin: MessageType,
        entity: Option<EntityRef>,
        message: &Message,
    ) {
        let correlation_id =
            self.shared
                .propose_correlation(self.id, request_id, responder, origin, entity);
        self.shared.send(responder, message, correlation_id);

        let shared = Arc::clone(&self.shared);
        let timeout = shared.proxy_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.expire_correlation(correlation_id);
        });
    }

    fn ack_control(&self, request_id: u32, control: ControlRequest) {
        self.respond(
            request_id,
            &Message::ControlEntityResponse(ControlResponse {
                entity: control.entity,
                command: control.command,
                data: ControlData::None,
            }),
        );
    }

    fn proxy_to_market_handler(
        &self,
        request_id: u32,
        origin: MessageType,
        entity: Option<EntityRef>,
        message: Message,
    ) {
        let Some(market_key) = self.market.clone() else {
            self.error(request_id, origin, entity, "Invalid market.");
            return;
        };
        let Some(handler) = self.shared.handler_of(&market_key) else {
            self.error(request_id, origin, entity, "No market handler.");
            return;
        };
        self.proxy(request_id, handler, origin, entity, &message);
    }

    fn proxy_to_session_market_handler(
        &self,
        request_id: u32,
        session_key: &EntityKey,
        origin: MessageType,
        entity: Option<EntityRef>,
        message: Message,
    ) {
        let market_key = self.shared.with_state(|state| {
            state
                .directory_ref()
                .session(&session_key.user, session_key.entity.id)
                .map(|session| {
                    EntityKey::new(session_key.user.clone(), EntityKind::Market, session.market_id)
                })
                .ok()
        });
        let Some(market_key) = market_key else {
            self.error(request_id, origin, entity, "Unknown market.");
            return;
        };
        let Some(handler) = self.shared.handler_of(&market_key) else {
            self.error(request_id, origin, entity, "No market handler.");
            return;
        };
        self.proxy(request_id, handler, origin, entity, &message);
    }

    /// Clear-and-replay a session's children to this connection.
    fn replay_session(&self, key: &EntityKey) {
        for kind in [
            EntityKind::SessionTransaction,
            EntityKind::SessionItem,
            EntityKind::SessionProperty,
            EntityKind::SessionOrder,
            EntityKind::SessionMarker,
            EntityKind::SessionLogEntry,
        ] {
            self.respond(0, &Message::RemoveAllEntities { kind });
        }
        let messages = self.shared.with_state(|state| {
            let Ok(session) = state.directory_ref().session(&key.user, key.entity.id) else {
                return Vec::new();
            };
            let ledger = session.ledger();
            let mut out = Vec::new();
            out.extend(ledger.transactions.values().cloned().map(|tx| {
                Message::UpdateEntity(EntityPayload::SessionTransaction(tx))
            }));
            out.extend(
                ledger
                    .items
                    .values()
                    .cloned()
                    .map(|item| Message::UpdateEntity(EntityPayload::SessionItem(item))),
            );
            out.extend(ledger.properties.values().cloned().map(|property| {
                Message::UpdateEntity(EntityPayload::SessionProperty(property))
            }));
            out.extend(
                ledger
                    .orders
                    .values()
                    .cloned()
                    .map(|order| Message::UpdateEntity(EntityPayload::SessionOrder(order))),
            );
            out.extend(
                ledger
                    .markers
                    .values()
                    .cloned()
                    .map(|marker| Message::UpdateEntity(EntityPayload::SessionMarker(marker))),
            );
            out.extend(
                ledger
                    .log
                    .iter()
                    .cloned()
                    .map(|entry| Message::UpdateEntity(EntityPayload::SessionLogEntry(entry))),
            );
            out
        });
        for message in messages {
            self.respond(0, &message);
        }
    }

    /// Clear-and-replay a market's children to this connection.
    fn replay_market(&self, key: &EntityKey) {
        for kind in [
            EntityKind::MarketBalance,
            EntityKind::MarketOrder,
            EntityKind::MarketTransaction,
        ] {
            self.respond(0, &Message::RemoveAllEntities { kind });
        }
        let messages = self.shared.with_state(|state| {
            let Ok(market) = state.directory_ref().market(&key.user, key.entity.id) else {
                return Vec::new();
            };
            let mut out = Vec::new();
            if let Some(balance) = &market.balance {
                out.push(Message::UpdateEntity(EntityPayload::MarketBalance(
                    balance.clone(),
                )));
            }
            out.extend(
                market
                    .transactions
                    .values()
                    .cloned()
                    .map(|tx| Message::UpdateEntity(EntityPayload::MarketTransaction(tx))),
            );
            out.extend(
                market
                    .orders
                    .values()
                    .cloned()
                    .map(|order| Message::UpdateEntity(EntityPayload::MarketOrder(order))),
            );
            out
        });
        for message in messages {
            self.respond(0, &message);
        }
    }

    /// After a mode switch the active ledger changed wholesale: every
    /// viewer drops what it had and receives the new active collections.
    fn resync_session_viewers(&self, key: &EntityKey) {
        for kind in [
            EntityKind::SessionTransaction,
            EntityKind::SessionItem,
            EntityKind::SessionProperty,
            EntityKind::SessionOrder,
            EntityKind::SessionMarker,
            EntityKind::SessionLogEntry,
        ] {
            self.shared
                .broadcast_viewers(key, &Message::RemoveAllEntities { kind }, None);
        }
        let messages = self.shared.with_state(|state| {
            let Ok(session) = state.directory_ref().session(&key.user, key.entity.id) else {
                return Vec::new();
            };
            let ledger = session.ledger();
            let mut out = Vec::new();
            out.extend(ledger.transactions.values().cloned().map(|tx| {
                Message::UpdateEntity(EntityPayload::SessionTransaction(tx))
            }));
            out.extend(
                ledger
                    .items
                    .values()
                    .cloned()
                    .map(|item| Message::UpdateEntity(EntityPayload::SessionItem(item))),
            );
            out.extend(ledger.properties.values().cloned().map(|property| {
                Message::UpdateEntity(EntityPayload::SessionProperty(property))
            }));
            out.extend(
                ledger
                    .orders
                    .values()
                    .cloned()
                    .map(|order| Message::UpdateEntity(EntityPayload::SessionOrder(order))),
            );
            out
        });
        for message in messages {
            self.shared.broadcast_viewers(key, &message, None);
        }
    }
}
