//! Session registry: which add-in instances are reachable, and over which
//! connection.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{hub::ConnectionId, protocol::ConsoleLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Word,
    Excel,
    #[serde(alias = "ppt")]
    PowerPoint,
    Outlook,
}

impl AppType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Word => "word",
            Self::Excel => "excel",
            Self::PowerPoint => "powerpoint",
            Self::Outlook => "outlook",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "word" => Ok(Self::Word),
            "excel" => Ok(Self::Excel),
            "powerpoint" | "ppt" => Ok(Self::PowerPoint),
            "outlook" => Ok(Self::Outlook),
            other => Err(format!(
                "unknown app type \"{other}\"; expected one of: word, excel, powerpoint, outlook"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub app_type: AppType,
    pub name: String,
    pub url: Option<String>,
    #[serde(skip)]
    pub connection: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip)]
    pub console: VecDeque<ConsoleEntry>,
}

/// Bidirectional index of live sessions.
///
/// `sessions` owns the records; `by_connection` is the reverse index. The
/// connection id is only a handle into the transport layer's hub.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    order: Vec<String>,
    by_connection: HashMap<ConnectionId, String>,
    next_seq: u64,
    console_capacity: usize,
}

impl SessionRegistry {
    pub fn new(console_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            by_connection: HashMap::new(),
            next_seq: 1,
            console_capacity,
        }
    }

    /// Creates a session for `connection` and returns its id along with the
    /// record it replaced, if the connection had already registered.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        app_type: AppType,
        name: String,
        url: Option<String>,
    ) -> (String, Option<Session>) {
        let replaced = self.unregister(connection);

        let seq = self.next_seq;
        self.next_seq += 1;
        let now = Utc::now();
        let session_id = format!("{app_type}-{}-{seq}", now.timestamp_millis());

        self.sessions.insert(
            session_id.clone(),
            Session {
                id: session_id.clone(),
                app_type,
                name,
                url,
                connection,
                connected_at: now,
                last_activity: now,
                console: VecDeque::new(),
            },
        );
        self.order.push(session_id.clone());
        self.by_connection.insert(connection, session_id.clone());

        (session_id, replaced)
    }

    pub fn lookup_by_connection(&self, connection: ConnectionId) -> Option<&str> {
        self.by_connection.get(&connection).map(String::as_str)
    }

    pub fn unregister(&mut self, connection: ConnectionId) -> Option<Session> {
        let session_id = self.by_connection.remove(&connection)?;
        self.order.retain(|id| id != &session_id);
        self.sessions.remove(&session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Snapshot in registration order, optionally restricted to one app type.
    pub fn list(&self, app_type: Option<AppType>) -> Vec<Session> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|session| app_type.map_or(true, |wanted| session.app_type == wanted))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn touch(&mut self, connection: ConnectionId) {
        if let Some(session) = self.session_for_connection_mut(connection) {
            session.last_activity = Utc::now();
        }
    }

    pub fn push_console(&mut self, connection: ConnectionId, level: ConsoleLevel, message: String) {
        let capacity = self.console_capacity;
        let Some(session) = self.session_for_connection_mut(connection) else {
            return;
        };
        if capacity == 0 {
            return;
        }

        while session.console.len() >= capacity {
            session.console.pop_front();
        }
        session.console.push_back(ConsoleEntry {
            level,
            message,
            at: Utc::now(),
        });
    }

    fn session_for_connection_mut(&mut self, connection: ConnectionId) -> Option<&mut Session> {
        let session_id = self.by_connection.get(&connection)?;
        self.sessions.get_mut(session_id)
    }
}
