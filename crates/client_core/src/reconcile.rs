use chrono::Utc;
use shared::{
    domain::{ClientToken, MessageId, ParticipantId, RoomId},
    protocol::{MessageContent, MessageRecord, OutgoingMessage},
};

use crate::types::{ChatMessage, DeliveryState, LocalId, MessageKey, OutboundDraft};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Replaced(usize),
    Appended(usize),
    /// The record belongs to a room that is not focused.
    Ignored,
}

/// Message list of the focused room. History is applied only under the
/// epoch it was requested with.
#[derive(Debug)]
pub struct MessageLog {
    me: ParticipantId,
    room_id: Option<RoomId>,
    epoch: u64,
    entries: Vec<ChatMessage>,
    next_local: u64,
}

impl MessageLog {
    pub fn new(me: ParticipantId) -> Self {
        Self {
            me,
            room_id: None,
            epoch: 0,
            entries: Vec::new(),
            next_local: 1,
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn reset(&mut self, room_id: RoomId) -> u64 {
        self.entries.clear();
        self.room_id = Some(room_id);
        self.bump_epoch()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.room_id = None;
        self.bump_epoch();
    }

    pub fn begin_resync(&mut self) -> u64 {
        self.bump_epoch()
    }

    fn bump_epoch(&mut self) -> u64 {
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    pub fn send_local(&mut self, content: MessageContent) -> Option<OutboundDraft> {
        let room_id = self.room_id.clone()?;
        let local_id = LocalId(self.next_local);
        self.next_local += 1;
        let client_token = ClientToken::generate();

        self.entries.push(ChatMessage {
            key: MessageKey::Pending(local_id),
            client_token: Some(client_token),
            sender_id: self.me.clone(),
            sender_name: None,
            content: content.clone(),
            created_at: Utc::now(),
            delivery: DeliveryState::Pending,
        });

        Some(OutboundDraft {
            local_id,
            message: OutgoingMessage {
                room_id,
                client_token,
                content,
            },
        })
    }

    pub fn reconcile(&mut self, record: MessageRecord) -> Reconciled {
        if self.room_id.as_ref() != Some(&record.room_id) {
            return Reconciled::Ignored;
        }

        let id = record.id.clone();
        let token = record.client_token;
        let message = ChatMessage::confirmed(record);

        if let Some(index) = self.position_of_confirmed(&id) {
            self.entries[index] = message;
            if let Some(token) = token {
                self.drop_unconfirmed_with_token(token, index);
            }
            let index = self.position_of_confirmed(&id).unwrap_or(index);
            return Reconciled::Replaced(index);
        }

        match self.position_of_unconfirmed_match(&message) {
            Some(index) => {
                self.entries[index] = message;
                Reconciled::Replaced(index)
            }
            None => {
                self.entries.push(message);
                Reconciled::Appended(self.entries.len() - 1)
            }
        }
    }

    pub fn mark_failed(&mut self, local_id: LocalId) -> bool {
        match self.position_of_local(local_id) {
            Some(index) if self.entries[index].delivery == DeliveryState::Pending => {
                self.entries[index].delivery = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn mark_failed_by_token(&mut self, token: ClientToken) -> Option<LocalId> {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.delivery == DeliveryState::Pending && entry.client_token == Some(token)
        })?;
        entry.delivery = DeliveryState::Failed;
        entry.local_id()
    }

    pub fn pending_ids(&self) -> Vec<LocalId> {
        self.entries
            .iter()
            .filter(|entry| entry.delivery == DeliveryState::Pending)
            .filter_map(ChatMessage::local_id)
            .collect()
    }

    /// Reuses the client token of the failed send.
    pub fn retry(&mut self, local_id: LocalId) -> Option<OutboundDraft> {
        let room_id = self.room_id.clone()?;
        let index = self.position_of_local(local_id)?;
        let entry = &mut self.entries[index];
        if entry.delivery != DeliveryState::Failed {
            return None;
        }
        entry.delivery = DeliveryState::Pending;
        let client_token = match entry.client_token {
            Some(token) => token,
            None => {
                let token = ClientToken::generate();
                entry.client_token = Some(token);
                token
            }
        };

        Some(OutboundDraft {
            local_id,
            message: OutgoingMessage {
                room_id,
                client_token,
                content: entry.content.clone(),
            },
        })
    }

    pub fn discard(&mut self, local_id: LocalId) -> bool {
        match self.position_of_local(local_id) {
            Some(index) if self.entries[index].delivery == DeliveryState::Failed => {
                self.entries.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Installs the server history for the current room. Entries that arrived
    /// while the request was in flight are merged back after it.
    pub fn apply_history(&mut self, epoch: u64, records: Vec<MessageRecord>) -> bool {
        if epoch != self.epoch {
            return false;
        }

        let live = std::mem::take(&mut self.entries);
        for record in records {
            match self.position_of_confirmed(&record.id) {
                Some(index) => self.entries[index] = ChatMessage::confirmed(record),
                None => self.entries.push(ChatMessage::confirmed(record)),
            }
        }

        // History records already paired with a live entry cannot absorb
        // another pending send.
        let mut claimed: Vec<bool> = self
            .entries
            .iter()
            .map(|history| {
                live.iter()
                    .any(|entry| entry.is_confirmed() && entry.id() == history.id())
            })
            .collect();

        for entry in live {
            match &entry.key {
                MessageKey::Confirmed(id) => {
                    if self.position_of_confirmed(id).is_none() {
                        self.entries.push(entry);
                    }
                }
                MessageKey::Pending(_) => {
                    match self.position_of_history_match(&entry, &claimed) {
                        Some(index) => {
                            claimed[index] = true;
                            let history = &mut self.entries[index];
                            if history.client_token.is_none() {
                                history.client_token = entry.client_token;
                            }
                        }
                        None => self.entries.push(entry),
                    }
                }
            }
        }
        true
    }

    fn position_of_history_match(&self, pending: &ChatMessage, claimed: &[bool]) -> Option<usize> {
        let mut unclaimed = (0..claimed.len()).filter(|&index| !claimed[index]);

        if let Some(token) = pending.client_token {
            let by_token = unclaimed
                .clone()
                .find(|&index| self.entries[index].client_token == Some(token));
            if by_token.is_some() {
                return by_token;
            }
        }

        unclaimed.find(|&index| {
            let history = &self.entries[index];
            history.sender_id == pending.sender_id
                && history.content == pending.content
                && tokens_compatible(pending.client_token, history.client_token)
        })
    }

    fn position_of_local(&self, local_id: LocalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.key == MessageKey::Pending(local_id))
    }

    fn position_of_confirmed(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id() == Some(id))
    }

    fn position_of_unconfirmed_match(&self, confirmed: &ChatMessage) -> Option<usize> {
        if let Some(token) = confirmed.client_token {
            let by_token = self.entries.iter().position(|entry| {
                !entry.is_confirmed() && entry.client_token == Some(token)
            });
            if by_token.is_some() {
                return by_token;
            }
        }

        self.entries.iter().position(|entry| {
            !entry.is_confirmed()
                && entry.sender_id == confirmed.sender_id
                && entry.content == confirmed.content
                && tokens_compatible(entry.client_token, confirmed.client_token)
        })
    }

    fn drop_unconfirmed_with_token(&mut self, token: ClientToken, keep: usize) {
        let mut index = 0;
        self.entries.retain(|entry| {
            let drop = index != keep && !entry.is_confirmed() && entry.client_token == Some(token);
            index += 1;
            !drop
        });
    }
}

fn tokens_compatible(local: Option<ClientToken>, remote: Option<ClientToken>) -> bool {
    match (local, remote) {
        (Some(local), Some(remote)) => local == remote,
        _ => true,
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
