//! Per-connection state machine:
//! `New -> Authenticated -> Closed`. Every request but `Connect` requires
//! `Authenticated`; idle time is tracked so the accept loop can enforce
//! `idle_timeout` independently of request/response traffic.

use std::time::Instant;

use rand::RngCore;

use crate::auth::user::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticated,
    Closed,
}

pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub user: Option<User>,
    pub last_activity: Instant,
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: generate_session_id(),
            state: SessionState::New,
            user: None,
            last_activity: Instant::now(),
        }
    }

    pub fn authenticate(&mut self, user: User) {
        self.user = Some(user);
        self.state = SessionState::Authenticated;
        self.touch();
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::user::Role;
    use std::collections::HashMap;

    fn user() -> User {
        User {
            username: "alice".to_string(),
            password_hash: vec![],
            password_salt: vec![],
            pbkdf2_iterations: 1000,
            api_key: "key".to_string(),
            role: Role::Read,
            database_permissions: HashMap::new(),
            created_at: "now".to_string(),
            last_login: None,
        }
    }

    #[test]
    fn new_session_is_unauthenticated() {
        let session = Session::new();
        assert_eq!(session.state, SessionState::New);
        assert!(!session.is_authenticated());
    }

    #[test]
    fn authenticate_transitions_state() {
        let mut session = Session::new();
        session.authenticate(user());
        assert!(session.is_authenticated());
        assert_eq!(session.user.unwrap().username, "alice");
    }

    #[test]
    fn close_transitions_out_of_authenticated() {
        let mut session = Session::new();
        session.authenticate(user());
        session.close();
        assert_eq!(session.state, SessionState::Closed);
    }
}
