//! Chat command handling on top of the ledger's read API.
//!
//! The service is transport agnostic: it consumes [`Inbound`] messages and
//! produces [`Outbound`] replies. It never settles anything; its only write is
//! creating a user's account on first contact.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error};

use crate::ledger::Ledger;
use crate::memo;
use crate::model::UserId;

/// A command the bot understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `/start` or `/help`.
    Start,
    /// `/balance` or the `Balance` keyboard button.
    Balance,
    /// `/invest` or the `Invest` keyboard button.
    Invest,
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix('/') {
            let word = rest.split_whitespace().next().unwrap_or_default();
            // Group chats address commands as /cmd@botname
            let name = word.split('@').next().unwrap_or_default();
            return match name.to_ascii_lowercase().as_str() {
                "start" | "help" => Some(Command::Start),
                "balance" => Some(Command::Balance),
                "invest" => Some(Command::Invest),
                _ => None,
            };
        }
        if text.eq_ignore_ascii_case("balance") {
            Some(Command::Balance)
        } else if text.eq_ignore_ascii_case("invest") {
            Some(Command::Invest)
        } else {
            None
        }
    }
}

/// Interactive elements attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Markup {
    /// Persistent keyboard, one button label per row.
    Keyboard(Vec<String>),
    /// Inline button opening a URL.
    Link { label: String, url: String },
}

/// A Markdown-formatted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub markup: Option<Markup>,
}

impl Reply {
    fn new(text: impl Into<String>, markup: Option<Markup>) -> Self {
        Self {
            text: text.into(),
            markup,
        }
    }
}

/// A chat message from a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub user: UserId,
    pub text: String,
}

/// Parses the line format `<user id> <text>` used by line-oriented buses.
impl FromStr for Inbound {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (user, text) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let user = user
            .parse()
            .map_err(|_| format!("expected '<user id> <text>', got '{line}'"))?;
        Ok(Inbound {
            user,
            text: text.trim().to_string(),
        })
    }
}

/// A reply addressed to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub user: UserId,
    pub reply: Reply,
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.user, self.reply.text.replace('\n', "\\n"))?;
        match &self.reply.markup {
            Some(Markup::Keyboard(buttons)) => write!(f, " [{}]", buttons.join("|")),
            Some(Markup::Link { label, url }) => write!(f, " [{label}]({url})"),
            None => Ok(()),
        }
    }
}

/// Renders replies to chat commands from ledger state.
#[derive(Clone)]
pub struct CommandService {
    ledger: Arc<Ledger>,
    deposit_address: String,
}

impl CommandService {
    pub fn new(ledger: Arc<Ledger>, deposit_address: impl Into<String>) -> Self {
        Self {
            ledger,
            deposit_address: deposit_address.into(),
        }
    }

    /// Reply to one message. Text that is not a command gets no reply.
    pub fn handle(&self, user: UserId, text: &str) -> Vec<Reply> {
        let Some(command) = Command::parse(text) else {
            debug!(user = %user, "ignoring non-command message");
            return Vec::new();
        };
        debug!(user = %user, ?command, "handling command");
        match command {
            Command::Start => self.welcome(user),
            Command::Balance => self.balance(user),
            Command::Invest => self.deposit_instructions(user),
        }
    }

    /// Handle messages from `inbox` until it ends or `outbox` is closed.
    pub async fn serve(
        &self,
        mut inbox: impl Stream<Item = Inbound> + Unpin,
        outbox: mpsc::Sender<Outbound>,
    ) {
        while let Some(message) = inbox.next().await {
            let user = message.user;
            // `/start` may append to the ledger journal, which fsyncs
            let service = self.clone();
            let replies =
                match tokio::task::spawn_blocking(move || service.handle(user, &message.text))
                    .await
                {
                    Ok(replies) => replies,
                    Err(e) => {
                        error!(user = %user, error = %e, "command handler failed");
                        continue;
                    }
                };
            for reply in replies {
                let outbound = Outbound { user, reply };
                if outbox.send(outbound).await.is_err() {
                    debug!("outbox closed, command service stopping");
                    return;
                }
            }
        }
    }

    fn welcome(&self, user: UserId) -> Vec<Reply> {
        // A failed insert is retried on the next /start, and settlement
        // creates the account anyway
        if let Err(e) = self.ledger.ensure_user(user) {
            error!(user = %user, error = %e, "failed to register user");
        }
        let keyboard = Markup::Keyboard(vec!["Invest".to_string(), "Balance".to_string()]);
        vec![Reply::new(
            "Hi! I am NiftyBot.\n\nHow can I help you today?",
            Some(keyboard),
        )]
    }

    fn balance(&self, user: UserId) -> Vec<Reply> {
        let balance = self.ledger.balance(user);
        vec![Reply::new(
            format!("Your balance: *{} TON*", balance.to_ton_string()),
            None,
        )]
    }

    fn deposit_instructions(&self, user: UserId) -> Vec<Reply> {
        let comment = memo::comment_for(user).to_string();
        let link = Markup::Link {
            label: "Invest".to_string(),
            url: format!("ton://transfer/{}?text={comment}", self.deposit_address),
        };
        [
            "Simply send any amount of TON to this address:".to_string(),
            format!("`{}`", self.deposit_address),
            "And include the following comment:".to_string(),
            format!("`{comment}`"),
        ]
        .into_iter()
        .map(|text| Reply::new(text, Some(link.clone())))
        .collect()
    }
}
