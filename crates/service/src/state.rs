use ahash::AHashMap;
use serde_json::Value;

use crate::{
    ident::Id,
    proto::{OutboundFrame, PresenceEntry, VoiceStats},
    session::Session,
};

/// A set of sessions that agreed to exchange media.
///
/// The room holds member ids only; sessions are looked up through the
/// session table, which keeps ownership acyclic.
pub struct Room {
    pub id: Id,
    pub members: Vec<Id>,
}

/// What `leave_room` observed while removing a member.
pub struct RoomExit {
    pub room_id: Id,
    /// Members still in the room right after the removal, before any
    /// dissolution. Dissolving rooms report their last member here too.
    pub remaining: Vec<Id>,
    /// The member left alone by this exit, if the room dissolved around it.
    pub dissolved: Option<Id>,
}

pub struct NameTaken;

/// The four shared tables, always mutated together under the hub's single
/// lock. The name index and the session table in particular must never be
/// observable out of step with each other.
#[derive(Default)]
pub struct HubState {
    pub sessions: AHashMap<Id, Session>,
    pub names: AHashMap<String, Id>,
    pub rooms: AHashMap<Id, Room>,
    pub push: AHashMap<Id, Value>,
}

impl HubState {
    /// Insert a fresh, still anonymous session.
    pub fn attach(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Bind `name` to the session, releasing any name it held before.
    ///
    /// Claiming the name a session already holds is a no-op success.
    pub fn claim(&mut self, id: &Id, name: &str) -> Result<(), NameTaken> {
        if let Some(owner) = self.names.get(name) {
            if owner != id {
                return Err(NameTaken);
            }
            return Ok(());
        }

        let Some(session) = self.sessions.get_mut(id) else {
            // The session vanished between dispatch and claim; nothing to bind.
            return Err(NameTaken);
        };

        if let Some(previous) = session.name.take() {
            self.names.remove(&previous);
        }

        session.name = Some(name.to_string());
        self.names.insert(name.to_string(), id.clone());
        Ok(())
    }

    /// Drop a session and, if named, its name binding. Idempotent.
    pub fn release(&mut self, id: &Id) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if let Some(name) = &session.name {
            self.names.remove(name);
        }
        Some(session)
    }

    /// Current presence table: every named session with its busy flag,
    /// ordered by name.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut users: Vec<PresenceEntry> = self
            .sessions
            .values()
            .filter_map(|session| {
                session.name.as_ref().map(|name| PresenceEntry {
                    id: session.id.clone(),
                    name: name.clone(),
                    busy: session.room_id.is_some(),
                })
            })
            .collect();

        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    /// Add a session to a room, creating the room on first join.
    pub fn join_room(&mut self, room_id: &Id, id: &Id) {
        let room = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room { id: room_id.clone(), members: Vec::new() });

        if !room.members.contains(id) {
            room.members.push(id.clone());
        }

        if let Some(session) = self.sessions.get_mut(id) {
            session.room_id = Some(room_id.clone());
        }
    }

    /// Remove a session from whatever room it is in, dissolving the room if
    /// at most one member stays behind.
    pub fn leave_room(&mut self, id: &Id) -> Option<RoomExit> {
        let room_id = self.sessions.get_mut(id)?.room_id.take()?;
        let room = self.rooms.get_mut(&room_id)?;

        room.members.retain(|member| member != id);
        let remaining = room.members.clone();

        let mut dissolved = None;
        if room.members.len() <= 1 {
            dissolved = room.members.pop();
            self.rooms.remove(&room_id);

            if let Some(last) = &dissolved
                && let Some(session) = self.sessions.get_mut(last)
            {
                session.room_id = None;
            }
        }

        Some(RoomExit { room_id, remaining, dissolved })
    }

    /// Whether two sessions share one non-empty room — the gate for relaying
    /// signaling payloads.
    pub fn same_room(&self, a: &Id, b: &Id) -> bool {
        match (self.sessions.get(a), self.sessions.get(b)) {
            (Some(a), Some(b)) => a.room_id.is_some() && a.room_id == b.room_id,
            _ => false,
        }
    }

    /// Queue a frame for one session, silently skipping sessions that are
    /// already gone.
    pub fn send_to(&self, id: &Id, frame: OutboundFrame) {
        if let Some(session) = self.sessions.get(id) {
            session.send(frame);
        }
    }

    /// Queue a frame for every named session whose channel is still open.
    pub fn broadcast(&self, frame: &OutboundFrame) {
        for session in self.sessions.values() {
            if session.name.is_some() && session.is_ready() {
                session.send(frame.clone());
            }
        }
    }

    /// Derive the voice capacity snapshot from the room table and the
    /// configured relay port range.
    pub fn voice_stats(&self, turn_host: Option<&str>, relay_ports_total: Option<u32>) -> VoiceStats {
        let active_calls = self.rooms.values().filter(|room| room.members.len() >= 2).count();

        let peer_links_estimate: u32 = self
            .rooms
            .values()
            .map(|room| {
                let k = room.members.len() as u32;
                k * k.saturating_sub(1) / 2
            })
            .sum();

        let relay_ports_used_estimate = match relay_ports_total {
            Some(total) => (2 * peer_links_estimate).min(total),
            None => 2 * peer_links_estimate,
        };

        let capacity_calls_estimate = relay_ports_total.map(|total| total / 2);

        VoiceStats {
            turn_host: turn_host.map(str::to_string),
            relay_ports_total,
            active_calls,
            peer_links_estimate,
            relay_ports_used_estimate,
            capacity_calls_estimate,
            max_conference_users_estimate: capacity_calls_estimate.map(VoiceStats::max_conference_users),
        }
    }
}
