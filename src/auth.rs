//! 令牌到用户与操作权限的映射，以及授权判定。

use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

use crate::config::AuthMode;
use crate::error::GatewayError;

/// Permission unit granted to a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    CreateDir,
    DeleteFile,
    PutFile,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::CreateDir => "create_dir",
            Action::DeleteFile => "delete_file",
            Action::PutFile => "put_file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create_dir" => Some(Action::CreateDir),
            "delete_file" => Some(Action::DeleteFile),
            "put_file" => Some(Action::PutFile),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub actions: HashSet<Action>,
}

impl User {
    pub fn can(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

/// Who a request was authorized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity<'a> {
    Anonymous,
    User(&'a User),
}

impl Identity<'_> {
    pub fn name(&self) -> &str {
        match self {
            Identity::Anonymous => "anonymous",
            Identity::User(user) => &user.name,
        }
    }
}

/// Read-only token table. Rebuilt wholesale, never mutated after construction.
#[derive(Debug, Default)]
pub struct Authorizer {
    users: HashMap<String, User>,
    enabled: bool,
}

impl Authorizer {
    /// Builds the table from `token:name:verb/verb` lines.
    pub fn from_lines<I, S>(lines: I, mode: AuthMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut configured = false;
        let mut users = HashMap::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            configured = true;
            if let Some((token, user)) = parse_user_line(line) {
                users.insert(token, user);
            }
        }

        let enabled = match mode {
            AuthMode::Auto => configured,
            AuthMode::Enabled => true,
            AuthMode::Disabled => false,
        };
        Self { users, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Every refusal is the same `AccessDenied`, whatever the reason.
    pub fn authorize(
        &self,
        token: Option<&str>,
        action: Action,
    ) -> Result<Identity<'_>, GatewayError> {
        if !self.enabled {
            return Ok(Identity::Anonymous);
        }
        token
            .filter(|token| !token.is_empty())
            .and_then(|token| self.users.get(token))
            .filter(|user| user.can(action))
            .map(Identity::User)
            .ok_or(GatewayError::AccessDenied)
    }
}

fn parse_user_line(line: &str) -> Option<(String, User)> {
    let mut parts = line.splitn(3, ':');
    let token = parts.next()?.trim();
    let name = parts.next()?.trim();
    let verbs = parts.next()?;

    let mut actions = HashSet::new();
    for verb in verbs.split('/').map(str::trim).filter(|verb| !verb.is_empty()) {
        match Action::parse(verb) {
            Some(action) => {
                actions.insert(action);
            }
            None => warn!(user = name, verb, "ignoring unknown action verb"),
        }
    }

    Some((
        token.to_string(),
        User {
            name: name.to_string(),
            actions,
        },
    ))
}
