use std::collections::HashMap;

use shared::{
    domain::{MessageId, ParticipantId, RoomId},
    protocol::{LastMessage, MessageRecord, Participant, ThreadRecord},
};

/// Sidebar list: one thread per counterpart, most recently updated first.
#[derive(Debug)]
pub struct ThreadList {
    me: ParticipantId,
    threads: Vec<ThreadRecord>,
    directory: Vec<Participant>,
    last_applied: HashMap<RoomId, MessageId>,
}

impl ThreadList {
    pub fn new(me: ParticipantId) -> Self {
        Self {
            me,
            threads: Vec::new(),
            directory: Vec::new(),
            last_applied: HashMap::new(),
        }
    }

    pub fn threads(&self) -> &[ThreadRecord] {
        &self.threads
    }

    pub fn set_directory(&mut self, participants: Vec<Participant>) {
        self.directory = participants;
    }

    /// Replaces the list with a fresh fetch, keeping only the newest thread
    /// for each counterpart.
    pub fn replace_all(&mut self, records: Vec<ThreadRecord>) {
        let mut newest: HashMap<ParticipantId, ThreadRecord> = HashMap::new();
        for record in records {
            let key = self.counterpart_key(&record);
            match newest.get(&key) {
                Some(kept) if kept.updated_at >= record.updated_at => {}
                _ => {
                    newest.insert(key, record);
                }
            }
        }
        self.threads = newest.into_values().collect();
        self.sort();
    }

    /// Applies a `thread-updated` notification or a single-thread fetch.
    /// Returns `false` when the record is older than what is already shown.
    pub fn upsert(&mut self, mut record: ThreadRecord) -> bool {
        let key = self.counterpart_key(&record);
        let existing = self
            .threads
            .iter()
            .position(|thread| thread.id == record.id)
            .or_else(|| {
                self.threads
                    .iter()
                    .position(|thread| self.counterpart_key(thread) == key)
            });

        if let Some(index) = existing {
            let current = &self.threads[index];
            if current.updated_at > record.updated_at {
                return false;
            }
            if current.id == record.id && current.product_context.is_some() {
                record.product_context = current.product_context.clone();
            }
            self.threads.remove(index);
        }

        self.threads.push(record);
        self.sort();
        true
    }

    /// Patches the summary of the thread a message belongs to. Returns
    /// `false` when the thread is unknown and has to be fetched.
    pub fn apply_message(&mut self, message: &MessageRecord, focused: bool) -> bool {
        let me = self.me.clone();
        let redelivered = self.last_applied.get(&message.room_id) == Some(&message.id);
        let Some(thread) = self
            .threads
            .iter_mut()
            .find(|thread| thread.id == message.room_id)
        else {
            return false;
        };

        let newer = thread
            .last_message
            .as_ref()
            .map_or(true, |last| last.created_at <= message.created_at);
        if newer {
            thread.last_message = Some(LastMessage {
                content: message.content.preview().to_string(),
                created_at: message.created_at,
            });
        }
        if message.created_at > thread.updated_at {
            thread.updated_at = message.created_at;
        }
        if !focused && !redelivered && message.sender_id != me {
            thread.unread_count = thread.unread_count.saturating_add(1);
        }
        self.last_applied
            .insert(message.room_id.clone(), message.id.clone());
        self.sort();
        true
    }

    pub fn mark_read(&mut self, room_id: &RoomId) -> bool {
        match self.threads.iter_mut().find(|thread| &thread.id == room_id) {
            Some(thread) if thread.unread_count > 0 => {
                thread.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn total_unread(&self) -> u32 {
        self.threads
            .iter()
            .fold(0u32, |sum, thread| sum.saturating_add(thread.unread_count))
    }

    /// Case-insensitive match on counterpart names and last message text.
    /// Never mutates the list.
    pub fn filter(&self, query: &str) -> Vec<&ThreadRecord> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.threads.iter().collect();
        }

        self.threads
            .iter()
            .filter(|thread| {
                let name_hit = thread
                    .participants
                    .iter()
                    .filter(|participant| participant.id != self.me)
                    .any(|participant| participant.name.to_lowercase().contains(&query));
                let text_hit = thread
                    .last_message
                    .as_ref()
                    .is_some_and(|last| last.content.to_lowercase().contains(&query));
                name_hit || text_hit
            })
            .collect()
    }

    /// Directory entries that have no conversation yet.
    pub fn contacts(&self) -> Vec<&Participant> {
        self.directory
            .iter()
            .filter(|participant| participant.id != self.me)
            .filter(|participant| {
                !self
                    .threads
                    .iter()
                    .any(|thread| self.counterpart_key(thread) == participant.id)
            })
            .collect()
    }

    fn counterpart_key(&self, thread: &ThreadRecord) -> ParticipantId {
        thread
            .counterpart(&self.me)
            .map(|participant| participant.id.clone())
            .unwrap_or_else(|| ParticipantId::new(thread.id.as_str()))
    }

    fn sort(&mut self) {
        self.threads.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}
