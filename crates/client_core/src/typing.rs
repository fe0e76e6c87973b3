use std::{collections::HashMap, time::Duration};

use shared::{
    domain::{ParticipantId, RoomId},
    protocol::ClientRequest,
};
use tokio::time::Instant;

#[derive(Debug)]
struct LocalTyping {
    room_id: RoomId,
    deadline: Instant,
}

/// Outgoing typing debounce and incoming typing display state.
#[derive(Debug)]
pub struct TypingPresence {
    me: ParticipantId,
    idle: Duration,
    display: Duration,
    local: Option<LocalTyping>,
    remote: HashMap<RoomId, HashMap<ParticipantId, Instant>>,
}

impl TypingPresence {
    pub fn new(me: ParticipantId, idle: Duration, display: Duration) -> Self {
        Self {
            me,
            idle,
            display,
            local: None,
            remote: HashMap::new(),
        }
    }

    /// When the current typing burst ends if no further input arrives.
    pub fn deadline(&self) -> Option<Instant> {
        self.local.as_ref().map(|local| local.deadline)
    }

    /// Announces `typing` at the start of a burst and pushes the idle deadline
    /// on every keystroke.
    pub fn on_input(&mut self, room_id: &RoomId, now: Instant) -> Vec<ClientRequest> {
        let deadline = now + self.idle;
        if let Some(local) = self.local.as_mut() {
            if &local.room_id == room_id {
                local.deadline = deadline;
                return Vec::new();
            }
        }

        let mut requests = Vec::with_capacity(2);
        if let Some(previous) = self.local.take() {
            requests.push(ClientRequest::StopTyping {
                room_id: previous.room_id,
            });
        }
        requests.push(ClientRequest::Typing {
            room_id: room_id.clone(),
        });
        self.local = Some(LocalTyping {
            room_id: room_id.clone(),
            deadline,
        });
        requests
    }

    /// Ends the burst once the deadline has passed. Returns `None` while input
    /// is still fresh or after the burst already ended.
    pub fn on_idle(&mut self, now: Instant) -> Option<ClientRequest> {
        match &self.local {
            Some(local) if now >= local.deadline => self.stop(),
            _ => None,
        }
    }

    /// Sending a message or leaving the room ends the burst immediately.
    pub fn stop(&mut self) -> Option<ClientRequest> {
        self.local
            .take()
            .map(|local| ClientRequest::StopTyping {
                room_id: local.room_id,
            })
    }

    pub fn remote_started(
        &mut self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
        now: Instant,
    ) {
        if participant_id == &self.me {
            return;
        }
        self.remote
            .entry(room_id.clone())
            .or_default()
            .insert(participant_id.clone(), now + self.display);
    }

    pub fn remote_stopped(&mut self, room_id: &RoomId, participant_id: &ParticipantId) {
        let Some(typists) = self.remote.get_mut(room_id) else {
            return;
        };
        typists.remove(participant_id);
        if typists.is_empty() {
            self.remote.remove(room_id);
        }
    }

    pub fn remote_typists(&self, room_id: &RoomId, now: Instant) -> Vec<ParticipantId> {
        let mut typists: Vec<ParticipantId> = self
            .remote
            .get(room_id)
            .map(|typists| {
                typists
                    .iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(participant, _)| participant.clone())
                    .collect()
            })
            .unwrap_or_default();
        typists.sort();
        typists
    }

    /// Earliest moment a shown remote typist expires.
    pub fn next_remote_expiry(&self) -> Option<Instant> {
        self.remote
            .values()
            .flat_map(|typists| typists.values())
            .min()
            .copied()
    }

    /// Drops expired remote typists. Returns the rooms whose indicator went
    /// from shown to hidden.
    pub fn prune(&mut self, now: Instant) -> Vec<RoomId> {
        let mut cleared = Vec::new();
        self.remote.retain(|room_id, typists| {
            typists.retain(|_, expires| *expires > now);
            if typists.is_empty() {
                cleared.push(room_id.clone());
                false
            } else {
                true
            }
        });
        cleared
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }
}
