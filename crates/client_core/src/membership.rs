use shared::{domain::RoomId, protocol::ClientRequest};

/// Tracks the single room that receives live events.
#[derive(Debug, Default)]
pub struct RoomMembership {
    focused: Option<RoomId>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn focused(&self) -> Option<&RoomId> {
        self.focused.as_ref()
    }

    pub fn is_focused(&self, room_id: &RoomId) -> bool {
        self.focused.as_ref() == Some(room_id)
    }

    pub fn focus(&mut self, room_id: RoomId) -> Vec<ClientRequest> {
        if self.is_focused(&room_id) {
            return Vec::new();
        }

        let previous = self.focused.replace(room_id.clone());
        let mut requests = Vec::with_capacity(2);
        if let Some(previous) = previous {
            requests.push(ClientRequest::Leave { room_id: previous });
        }
        requests.push(ClientRequest::Join { room_id });
        requests
    }

    pub fn blur(&mut self) -> Vec<ClientRequest> {
        self.focused
            .take()
            .map(|room_id| vec![ClientRequest::Leave { room_id }])
            .unwrap_or_default()
    }

    /// The server forgets subscriptions when the socket drops.
    pub fn on_reconnected(&self) -> Vec<ClientRequest> {
        match &self.focused {
            Some(room_id) => vec![
                ClientRequest::Join {
                    room_id: room_id.clone(),
                },
                ClientRequest::MarkRead {
                    room_id: room_id.clone(),
                },
            ],
            None => Vec::new(),
        }
    }
}
