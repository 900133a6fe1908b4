use std::time::Instant;

use serde_json::{Value, json};

use crate::{
    Hub, HubHandler, PushDelivery,
    ident::{self, Id},
    proto::{self, ErrorCode, InboundFrame, OutboundFrame, PeerEntry},
    state::HubState,
};

/// Chat lines starting with this literal quote another message and stay
/// public even though they begin with `@`.
const REPLY_PREFIX: &str = "@reply [";

/// A push delivery owed once the state lock is released.
struct PushJob {
    session: Id,
    subscription: Value,
    payload: Value,
}

impl<T: HubHandler> Hub<T> {
    /// Run one inbound text frame through the state machine.
    ///
    /// Everything except push delivery happens under the state lock; push
    /// jobs are collected and flushed after it is released.
    pub async fn handle_frame(&self, id: &Id, text: &str) {
        let mut jobs = Vec::new();

        {
            let mut state = self.state.lock();

            let (frame, named) = {
                let Some(session) = state.sessions.get_mut(id) else {
                    return;
                };

                let now = Instant::now();
                session.last_frame_at = now;

                if !session.rate.admit(now) {
                    session.send(OutboundFrame::Error { code: ErrorCode::RateLimit });
                    return;
                }

                match proto::decode(text) {
                    Ok(frame) => (frame, session.name.is_some()),
                    Err(code) => {
                        session.send(OutboundFrame::Error { code });
                        return;
                    }
                }
            };

            match frame {
                // Push registration is allowed in any state and never replied to.
                InboundFrame::PushSubscribe { subscription } => {
                    if self.options.handler.push_enabled() {
                        state.push.insert(id.clone(), subscription);
                    }
                }
                InboundFrame::PushUnsubscribe => {
                    state.push.remove(id);
                }
                InboundFrame::SetName { name } => self.on_set_name(&mut state, id, &name),
                _ if !named => {
                    state.send_to(id, OutboundFrame::Error { code: ErrorCode::NoName });
                }
                InboundFrame::CallStart { to } => self.on_call_start(&mut state, id, &to, &mut jobs),
                InboundFrame::CallAccept { from, room_id } => {
                    self.on_call_accept(&mut state, id, &from, &room_id);
                }
                InboundFrame::CallReject { from, .. } => self.on_call_reject(&mut state, id, &from),
                InboundFrame::CallHangup => self.depart(&mut state, id),
                InboundFrame::Signal { to, payload } => Self::on_signal(&state, id, &to, payload),
                InboundFrame::ChatSend { text } => self.on_chat_send(&mut state, id, &text, &mut jobs),
            }
        }

        self.flush_push(jobs).await;
    }

    /// Tear one session down: synthesized hangup, push and name removal, the
    /// goodbye broadcast. Safe to call more than once per session.
    pub fn disconnect(&self, id: &Id) {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(id) {
            return;
        }

        self.depart(&mut state, id);
        state.push.remove(id);

        let removed = state.release(id);
        if let Some(name) = removed.and_then(|session| session.name) {
            log::info!("session closed: id={id}, name={name}");
            state.broadcast(&OutboundFrame::system(format!("{name} left.")));
            self.broadcast_presence(&state);
        } else {
            log::info!("session closed: id={id}");
        }
    }

    fn on_set_name(&self, state: &mut HubState, id: &Id, name: &Value) {
        let Some(name) = ident::validate_name(name) else {
            state.send_to(
                id,
                OutboundFrame::NameResult { ok: false, name: None, reason: Some("invalid") },
            );
            return;
        };

        if state.claim(id, &name).is_err() {
            state.send_to(
                id,
                OutboundFrame::NameResult { ok: false, name: None, reason: Some("taken") },
            );
            return;
        }

        state.send_to(
            id,
            OutboundFrame::NameResult { ok: true, name: Some(name.clone()), reason: None },
        );

        log::info!("name claimed: id={id}, name={name}");
        state.broadcast(&OutboundFrame::system(format!("{name} joined.")));
        self.broadcast_presence(state);
    }

    fn on_call_start(&self, state: &mut HubState, id: &Id, to: &Id, jobs: &mut Vec<PushJob>) {
        if to == id {
            state.send_to(id, OutboundFrame::CallStartResult { ok: false, reason: Some("self") });
            return;
        }

        let reason = match state.sessions.get(to) {
            None => Some("not_found"),
            Some(target) if target.name.is_none() => Some("not_ready"),
            Some(target) if target.room_id.is_some() => Some("busy"),
            Some(_) => None,
        };

        if let Some(reason) = reason {
            state.send_to(id, OutboundFrame::CallStartResult { ok: false, reason: Some(reason) });
            return;
        }

        let Some(caller) = state.sessions.get(id) else {
            return;
        };
        let from_name = caller.name.clone().unwrap_or_default();

        // A caller already in a room invites the callee into it; otherwise a
        // fresh room rings between the pair.
        let room_id = caller.room_id.clone().unwrap_or_else(Id::generate);
        state.join_room(&room_id, id);
        state.join_room(&room_id, to);

        state.send_to(
            to,
            OutboundFrame::IncomingCall {
                from: id.clone(),
                from_name: from_name.clone(),
                room_id: room_id.clone(),
            },
        );

        if let Some(subscription) = state.push.get(to) {
            jobs.push(PushJob {
                session: to.clone(),
                subscription: subscription.clone(),
                payload: json!({
                    "type": "incomingCall",
                    "fromName": &from_name,
                    "roomId": &room_id,
                }),
            });
        }

        state.send_to(id, OutboundFrame::CallStartResult { ok: true, reason: None });
        log::info!("call start: from={id}, to={to}, room={room_id}");
        self.broadcast_presence(state);
    }

    fn on_call_accept(&self, state: &mut HubState, id: &Id, from: &Id, room_id: &Id) {
        let caller_in = state
            .sessions
            .get(from)
            .is_some_and(|caller| caller.room_id.as_ref() == Some(room_id));
        let self_in = state
            .sessions
            .get(id)
            .is_some_and(|session| session.room_id.as_ref() == Some(room_id));

        // A stale or forged accept: drop whatever half-joined membership the
        // accepter holds and resynchronize everyone's busy flags.
        if !caller_in || !self_in {
            if let Some(exit) = state.leave_room(id)
                && let Some(last) = &exit.dissolved
            {
                state.send_to(last, OutboundFrame::CallEnded { reason: "alone" });
            }
            self.broadcast_presence(state);
            return;
        }

        let joiner = PeerEntry {
            id: id.clone(),
            name: state
                .sessions
                .get(id)
                .and_then(|session| session.name.clone())
                .unwrap_or_default(),
        };

        let members = state.rooms.get(room_id).map(|room| room.members.clone()).unwrap_or_default();
        let peers: Vec<PeerEntry> = members
            .iter()
            .filter(|member| *member != id)
            .filter_map(|member| {
                state.sessions.get(member).map(|session| PeerEntry {
                    id: member.clone(),
                    name: session.name.clone().unwrap_or_default(),
                })
            })
            .collect();

        // Existing members offer to the joiner: they learn about the joiner
        // through roomPeerJoined, the joiner answers whatever comes back from
        // the roomPeers list.
        for peer in &peers {
            state.send_to(
                &peer.id,
                OutboundFrame::RoomPeerJoined { room_id: room_id.clone(), peer: joiner.clone() },
            );
        }

        state.send_to(id, OutboundFrame::RoomPeers { room_id: room_id.clone(), peers });
        log::info!("call accept: session={id}, room={room_id}");
    }

    fn on_call_reject(&self, state: &mut HubState, id: &Id, from: &Id) {
        state.send_to(from, OutboundFrame::CallRejected { reason: "rejected" });
        self.depart(state, id);
    }

    fn on_signal(state: &HubState, id: &Id, to: &Id, payload: Value) {
        // Signaling is confined to same-room peers; anything else is dropped
        // without a reply.
        if !state.same_room(id, to) {
            return;
        }

        let Some(sender) = state.sessions.get(id) else {
            return;
        };

        state.send_to(
            to,
            OutboundFrame::Signal {
                from: id.clone(),
                from_name: sender.name.clone().unwrap_or_default(),
                payload,
            },
        );
    }

    fn on_chat_send(&self, state: &mut HubState, id: &Id, text: &Value, jobs: &mut Vec<PushJob>) {
        let Some(text) = ident::validate_chat(text) else {
            state.send_to(id, OutboundFrame::Error { code: ErrorCode::BadChat });
            return;
        };

        let from_name = state
            .sessions
            .get(id)
            .and_then(|session| session.name.clone())
            .unwrap_or_default();

        if !text.starts_with(REPLY_PREFIX)
            && let Some((name, body)) = ident::parse_private_prefix(&text)
        {
            let Some(target) = state.names.get(name).cloned() else {
                state.send_to(id, OutboundFrame::Error { code: ErrorCode::PmNotFound });
                return;
            };

            if &target == id {
                state.send_to(id, OutboundFrame::Error { code: ErrorCode::PmSelf });
                return;
            }

            let frame = OutboundFrame::Chat {
                at_iso: proto::now_iso(),
                from: Some(id.clone()),
                from_name: from_name.clone(),
                to: Some(target.clone()),
                to_name: Some(name.to_string()),
                text: body.to_string(),
                private: true,
            };

            state.send_to(id, frame.clone());
            state.send_to(&target, frame);

            if let Some(subscription) = state.push.get(&target) {
                jobs.push(PushJob {
                    session: target.clone(),
                    subscription: subscription.clone(),
                    payload: json!({
                        "type": "chat",
                        "fromName": &from_name,
                        "text": body,
                        "private": true,
                    }),
                });
            }

            return;
        }

        let frame = OutboundFrame::Chat {
            at_iso: proto::now_iso(),
            from: Some(id.clone()),
            from_name: from_name.clone(),
            to: None,
            to_name: None,
            text: text.clone(),
            private: false,
        };
        state.broadcast(&frame);

        for (session, subscription) in state.push.iter() {
            if session == id {
                continue;
            }
            if state.sessions.get(session).is_none_or(|s| s.name.is_none()) {
                continue;
            }
            jobs.push(PushJob {
                session: session.clone(),
                subscription: subscription.clone(),
                payload: json!({
                    "type": "chat",
                    "fromName": &from_name,
                    "text": &text,
                    "private": false,
                }),
            });
        }
    }

    /// Leave the current room on behalf of `id`, notifying the peers left
    /// behind and dissolving the room when it falls to one member.
    fn depart(&self, state: &mut HubState, id: &Id) {
        let Some(exit) = state.leave_room(id) else {
            return;
        };

        for peer in &exit.remaining {
            state.send_to(
                peer,
                OutboundFrame::RoomPeerLeft { room_id: exit.room_id.clone(), peer_id: id.clone() },
            );
        }

        if let Some(last) = &exit.dissolved {
            state.send_to(last, OutboundFrame::CallEnded { reason: "alone" });
        }

        log::info!("room left: session={id}, room={}", exit.room_id);
        self.broadcast_presence(state);
    }

    fn broadcast_presence(&self, state: &HubState) {
        let frame = OutboundFrame::Presence {
            users: state.snapshot(),
            voice: state.voice_stats(self.turn_host.as_deref(), self.options.relay_ports_total),
        };
        state.broadcast(&frame);
    }

    async fn flush_push(&self, jobs: Vec<PushJob>) {
        for job in jobs {
            match self.options.handler.push_send(job.subscription, job.payload).await {
                PushDelivery::Delivered => {}
                PushDelivery::Gone => {
                    // The gateway says this subscription is permanently dead.
                    self.state.lock().push.remove(&job.session);
                    log::info!("push subscription gone: session={}", job.session);
                }
                PushDelivery::Failed => {
                    log::warn!("push delivery failed: session={}", job.session);
                }
            }
        }
    }
}
