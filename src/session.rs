//! The owner's configuration conversation.
//!
//! A single slot holds what the owner's next free-text message means. Menu
//! buttons move the slot into one of the `Awaiting*` states, the next
//! matching message is validated here, and the caller applies the result
//! to the settings. Only one flow runs at a time; pressing another button
//! simply overwrites the slot.

use uuid::Uuid;

use crate::sources::twitch::CREDENTIAL_LEN;
use crate::store::{ChatKind, Feed};

pub const PHRASE_LEN: usize = 16;

const CHANNEL_LINK_PREFIX: &str = "https://t.me/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingAction {
    #[default]
    Idle,
    AwaitingChannelLink,
    AwaitingRssDomain,
    AwaitingTwitchUsername,
    AwaitingClientId,
    AwaitingClientSecret,
    AwaitingAlertText,
    /// Phrase issued; waiting for it to show up in a thread of the target chat
    AwaitingThreadPhrase(Feed),
    /// Thread captured; waiting for the owner to confirm or reject it
    AwaitingThreadConfirmation(Feed),
    /// Waiting for the bot to be added to (or a post forwarded from) the new chat
    AwaitingChatForward(ChatKind),
    AwaitingChatConfirmation(ChatKind),
}

impl PendingAction {
    pub fn is_idle(&self) -> bool {
        matches!(self, PendingAction::Idle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateChat {
    pub id: i64,
    pub title: String,
    pub kind: ChatKind,
}

/// Values collected mid-flow, before they are committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scratch {
    pub chat: Option<CandidateChat>,
    pub phrase: Option<String>,
    pub client_id: Option<String>,
    pub thread_id: Option<i32>,
}

/// A free-text message as seen by the state machine.
#[derive(Debug, Clone, Copy)]
pub struct TextInput<'a> {
    pub text: &'a str,
    pub chat_id: i64,
    /// Forum topic id, `0` outside topics
    pub thread_id: i32,
    pub from_owner: bool,
    /// The configured `CHAT_ID`
    pub target_chat: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotChannelLink,
    BadDomain,
    BadUsername,
    CredentialLength,
    EmptyText,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::NotChannelLink => {
                "This is not a link to a Telegram channel. Send a link like https://t.me/channel"
            }
            Rejection::BadDomain => {
                "That does not look like an address. Send it as host:port, e.g. 127.0.0.1:3000"
            }
            Rejection::BadUsername => "Send the Twitch channel name as a single word",
            Rejection::CredentialLength => {
                "The token has an unexpected length. Send it again without spaces or extra characters"
            }
            Rejection::EmptyText => "The text is empty. Send the alert text again",
        }
    }
}

/// Result of feeding one message into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextOutcome {
    /// Nothing is pending for this message
    Ignored,
    /// Input failed validation; the state is unchanged
    Invalid(Rejection),
    ChannelLink(String),
    RssDomain(String),
    TwitchUsername(String),
    /// Client id stored in scratch; now waiting for the secret
    ClientIdAccepted,
    /// Both values have the right shape; the caller verifies them with Twitch
    /// and then calls [`Session::finish`] or [`Session::retry_credentials`]
    Credentials {
        client_id: String,
        client_secret: String,
    },
    AlertText(String),
    ThreadCaptured { feed: Feed, thread_id: i32 },
}

#[derive(Debug, Default)]
pub struct Session {
    pending: PendingAction,
    scratch: Scratch,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> PendingAction {
        self.pending
    }

    #[cfg(test)]
    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    /// Enter a new flow, discarding whatever was pending before.
    pub fn begin(&mut self, action: PendingAction) {
        self.scratch = Scratch::default();
        self.pending = action;
    }

    /// Start the thread-identification flow with a fresh phrase.
    pub fn issue_phrase(&mut self, feed: Feed) -> String {
        let phrase = new_phrase();
        self.begin(PendingAction::AwaitingThreadPhrase(feed));
        self.scratch.phrase = Some(phrase.clone());
        phrase
    }

    /// Back to idle with all scratch values cleared.
    pub fn cancel(&mut self) {
        self.pending = PendingAction::Idle;
        self.scratch = Scratch::default();
    }

    pub fn finish(&mut self) {
        self.cancel();
    }

    /// Credentials were rejected: ask for the client id again.
    pub fn retry_credentials(&mut self) {
        self.scratch = Scratch::default();
        self.pending = PendingAction::AwaitingClientId;
    }

    pub fn on_text(&mut self, input: TextInput<'_>) -> TextOutcome {
        let text = input.text.trim();

        if let PendingAction::AwaitingThreadPhrase(feed) = self.pending {
            return self.capture_thread(feed, text, input);
        }

        if !input.from_owner {
            return TextOutcome::Ignored;
        }

        match self.pending {
            PendingAction::AwaitingChannelLink => match parse_channel_link(text) {
                Some(name) => self.done(TextOutcome::ChannelLink(name)),
                None => TextOutcome::Invalid(Rejection::NotChannelLink),
            },
            PendingAction::AwaitingRssDomain => match normalize_domain(text) {
                Some(domain) => self.done(TextOutcome::RssDomain(domain)),
                None => TextOutcome::Invalid(Rejection::BadDomain),
            },
            PendingAction::AwaitingTwitchUsername => {
                if is_single_word(text) {
                    self.done(TextOutcome::TwitchUsername(text.to_string()))
                } else {
                    TextOutcome::Invalid(Rejection::BadUsername)
                }
            }
            PendingAction::AwaitingClientId => {
                if !is_credential(text) {
                    return TextOutcome::Invalid(Rejection::CredentialLength);
                }
                self.scratch.client_id = Some(text.to_string());
                self.pending = PendingAction::AwaitingClientSecret;
                TextOutcome::ClientIdAccepted
            }
            PendingAction::AwaitingClientSecret => {
                if !is_credential(text) {
                    return TextOutcome::Invalid(Rejection::CredentialLength);
                }
                match self.scratch.client_id.clone() {
                    Some(client_id) => TextOutcome::Credentials {
                        client_id,
                        client_secret: text.to_string(),
                    },
                    None => {
                        self.retry_credentials();
                        TextOutcome::Invalid(Rejection::CredentialLength)
                    }
                }
            }
            PendingAction::AwaitingAlertText => {
                if text.is_empty() {
                    TextOutcome::Invalid(Rejection::EmptyText)
                } else {
                    self.done(TextOutcome::AlertText(input.text.to_string()))
                }
            }
            PendingAction::Idle
            | PendingAction::AwaitingThreadPhrase(_)
            | PendingAction::AwaitingThreadConfirmation(_)
            | PendingAction::AwaitingChatForward(_)
            | PendingAction::AwaitingChatConfirmation(_) => TextOutcome::Ignored,
        }
    }

    fn capture_thread(&mut self, feed: Feed, text: &str, input: TextInput<'_>) -> TextOutcome {
        let phrase_matches = self.scratch.phrase.as_deref() == Some(text);
        let in_target = input.target_chat == Some(input.chat_id);
        if !phrase_matches || !in_target {
            return TextOutcome::Ignored;
        }

        self.scratch.thread_id = Some(input.thread_id);
        self.pending = PendingAction::AwaitingThreadConfirmation(feed);
        TextOutcome::ThreadCaptured {
            feed,
            thread_id: input.thread_id,
        }
    }

    /// The thread the owner just confirmed, if `feed` was awaiting one.
    pub fn confirm_thread(&mut self, feed: Feed) -> Option<i32> {
        if self.pending != PendingAction::AwaitingThreadConfirmation(feed) {
            return None;
        }
        let thread_id = self.scratch.thread_id;
        self.finish();
        thread_id
    }

    /// Record the chat the bot was added to, when a chat change is pending.
    pub fn offer_chat(&mut self, chat: CandidateChat) -> bool {
        let PendingAction::AwaitingChatForward(kind) = self.pending else {
            return false;
        };
        self.scratch.chat = Some(chat);
        self.pending = PendingAction::AwaitingChatConfirmation(kind);
        true
    }

    pub fn confirm_chat(&mut self) -> Option<CandidateChat> {
        if !matches!(self.pending, PendingAction::AwaitingChatConfirmation(_)) {
            return None;
        }
        let chat = self.scratch.chat.take();
        self.finish();
        chat
    }

    /// Wrong chat: keep waiting for the right one.
    pub fn reject_chat(&mut self) -> bool {
        let PendingAction::AwaitingChatConfirmation(kind) = self.pending else {
            return false;
        };
        self.scratch.chat = None;
        self.pending = PendingAction::AwaitingChatForward(kind);
        true
    }

    fn done(&mut self, outcome: TextOutcome) -> TextOutcome {
        self.finish();
        outcome
    }
}

pub fn new_phrase() -> String {
    Uuid::new_v4().simple().to_string()[..PHRASE_LEN].to_string()
}

/// `https://t.me/name` → `name`
pub fn parse_channel_link(text: &str) -> Option<String> {
    let (_, rest) = text.split_once(CHANNEL_LINK_PREFIX)?;
    let name = rest
        .split(['/', '?', ' ', '\n'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('@');
    (!name.is_empty()).then(|| name.to_string())
}

/// Strip an optional scheme and trailing slash; reject anything with spaces.
pub fn normalize_domain(text: &str) -> Option<String> {
    let domain = text
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    (is_single_word(domain)).then(|| domain.to_string())
}

fn is_single_word(text: &str) -> bool {
    !text.is_empty() && !text.chars().any(char::is_whitespace)
}

fn is_credential(text: &str) -> bool {
    text.chars().count() == CREDENTIAL_LEN && is_single_word(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_ID: &str = "abcdefghijklmnopqrstuvwxyz0123";
    const SECRET: &str = "0123456789abcdefghijklmnopqrst";

    fn owner_text(text: &str) -> TextInput<'_> {
        TextInput {
            text,
            chat_id: 10,
            thread_id: 0,
            from_owner: true,
            target_chat: Some(-100),
        }
    }

    fn awaiting_states() -> Vec<PendingAction> {
        vec![
            PendingAction::AwaitingChannelLink,
            PendingAction::AwaitingRssDomain,
            PendingAction::AwaitingTwitchUsername,
            PendingAction::AwaitingClientId,
            PendingAction::AwaitingClientSecret,
            PendingAction::AwaitingAlertText,
            PendingAction::AwaitingThreadPhrase(Feed::News),
            PendingAction::AwaitingThreadConfirmation(Feed::Clips),
            PendingAction::AwaitingChatForward(ChatKind::Group),
            PendingAction::AwaitingChatConfirmation(ChatKind::Channel),
        ]
    }

    #[test]
    fn test_cancel_from_every_state_clears_scratch() {
        for state in awaiting_states() {
            let mut session = Session::new();
            session.begin(state);
            session.scratch = Scratch {
                chat: Some(CandidateChat {
                    id: 1,
                    title: "t".into(),
                    kind: ChatKind::Group,
                }),
                phrase: Some("p".into()),
                client_id: Some("c".into()),
                thread_id: Some(3),
            };
            session.cancel();
            assert_eq!(session.pending(), PendingAction::Idle);
            assert_eq!(session.scratch(), &Scratch::default());
        }
    }

    #[test]
    fn test_idle_ignores_text() {
        let mut session = Session::new();
        assert_eq!(
            session.on_text(owner_text("https://t.me/anything")),
            TextOutcome::Ignored
        );
        assert!(session.pending().is_idle());
    }

    #[test]
    fn test_channel_link_validation() {
        let mut session = Session::new();
        session.begin(PendingAction::AwaitingChannelLink);

        assert_eq!(
            session.on_text(owner_text("just a name")),
            TextOutcome::Invalid(Rejection::NotChannelLink)
        );
        assert_eq!(session.pending(), PendingAction::AwaitingChannelLink);

        assert_eq!(
            session.on_text(owner_text("https://t.me/somechannel/")),
            TextOutcome::ChannelLink("somechannel".into())
        );
        assert!(session.pending().is_idle());
    }

    #[test]
    fn test_non_owner_text_is_ignored() {
        let mut session = Session::new();
        session.begin(PendingAction::AwaitingRssDomain);
        let input = TextInput {
            from_owner: false,
            ..owner_text("127.0.0.1:3000")
        };
        assert_eq!(session.on_text(input), TextOutcome::Ignored);
        assert_eq!(session.pending(), PendingAction::AwaitingRssDomain);
    }

    #[test]
    fn test_credential_flow() {
        let mut session = Session::new();
        session.begin(PendingAction::AwaitingClientId);

        assert_eq!(
            session.on_text(owner_text("short")),
            TextOutcome::Invalid(Rejection::CredentialLength)
        );
        assert_eq!(session.pending(), PendingAction::AwaitingClientId);

        assert_eq!(
            session.on_text(owner_text(CLIENT_ID)),
            TextOutcome::ClientIdAccepted
        );
        assert_eq!(session.pending(), PendingAction::AwaitingClientSecret);

        assert_eq!(
            session.on_text(owner_text(SECRET)),
            TextOutcome::Credentials {
                client_id: CLIENT_ID.into(),
                client_secret: SECRET.into()
            }
        );

        session.retry_credentials();
        assert_eq!(session.pending(), PendingAction::AwaitingClientId);
        assert_eq!(session.scratch().client_id, None);
    }

    #[test]
    fn test_thread_phrase_capture_and_confirm() {
        let mut session = Session::new();
        let phrase = session.issue_phrase(Feed::News);
        assert_eq!(phrase.len(), PHRASE_LEN);

        let elsewhere = TextInput {
            text: &phrase,
            chat_id: -200,
            thread_id: 42,
            from_owner: false,
            target_chat: Some(-100),
        };
        assert_eq!(session.on_text(elsewhere), TextOutcome::Ignored);

        let wrong_text = TextInput {
            text: "hello",
            chat_id: -100,
            ..elsewhere
        };
        assert_eq!(session.on_text(wrong_text), TextOutcome::Ignored);

        let in_thread = TextInput {
            chat_id: -100,
            ..elsewhere
        };
        assert_eq!(
            session.on_text(in_thread),
            TextOutcome::ThreadCaptured {
                feed: Feed::News,
                thread_id: 42
            }
        );
        assert_eq!(
            session.pending(),
            PendingAction::AwaitingThreadConfirmation(Feed::News)
        );

        assert_eq!(session.confirm_thread(Feed::Alerts), None);
        assert_eq!(session.confirm_thread(Feed::News), Some(42));
        assert!(session.pending().is_idle());
    }

    #[test]
    fn test_chat_offer_confirm_and_reject() {
        let mut session = Session::new();
        let chat = CandidateChat {
            id: -100555,
            title: "My group".into(),
            kind: ChatKind::Group,
        };
        assert!(!session.offer_chat(chat.clone()));

        session.begin(PendingAction::AwaitingChatForward(ChatKind::Group));
        assert!(session.offer_chat(chat.clone()));
        assert!(session.reject_chat());
        assert_eq!(
            session.pending(),
            PendingAction::AwaitingChatForward(ChatKind::Group)
        );

        assert!(session.offer_chat(chat.clone()));
        assert_eq!(session.confirm_chat(), Some(chat));
        assert!(session.pending().is_idle());
    }

    #[test]
    fn test_begin_overwrites_stale_flow() {
        let mut session = Session::new();
        session.begin(PendingAction::AwaitingClientId);
        session.on_text(owner_text(CLIENT_ID));
        session.begin(PendingAction::AwaitingAlertText);
        assert_eq!(session.scratch().client_id, None);
        assert_eq!(
            session.on_text(owner_text("<b>Live!</b>")),
            TextOutcome::AlertText("<b>Live!</b>".into())
        );
    }

    #[test]
    fn test_domain_normalization() {
        assert_eq!(
            normalize_domain("http://127.0.0.1:3000/"),
            Some("127.0.0.1:3000".into())
        );
        assert_eq!(normalize_domain("two words"), None);
        assert_eq!(normalize_domain(""), None);
    }
}
