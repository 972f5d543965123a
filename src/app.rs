//! Shared application state.
//!
//! `AppState` owns the settings store, the configuration session, the polling
//! cursors and the registry of running feed loops. Chat handlers call the
//! operations here and get transport-neutral [`Reply`] values back; the
//! polling loops call `run_tick`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use teloxide::utils::html;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::logging;
use crate::menu::{self, Button, Callback, Keyboard, Reply, ThreadAction};
use crate::platform::{self, Destination, LinkButton, Notifier};
use crate::scheduler::Scheduler;
use crate::session::{CandidateChat, PendingAction, Session, TextInput, TextOutcome};
use crate::sources::{Clip, PostSource, StreamSource, TwitchError};
use crate::store::{
    ChatKind, Feed, SettingKey, Settings, SettingsStore, StateFile, ALERT_MESSAGE_FILE,
    LAST_CLIP_FILE, LAST_POST_FILE,
};

const TWITCH_CONSOLE_URL: &str = "https://dev.twitch.tv/console/apps";

/// Cached Twitch app token and the resolved broadcaster id.
#[derive(Debug, Default)]
struct TwitchAuth {
    access_token: Option<String>,
    /// Login the id was resolved for, then the id
    broadcaster: Option<(String, String)>,
}

/// Everything needed for one round of Helix calls.
struct TwitchSession {
    client_id: String,
    token: String,
    user_id: String,
}

/// A plain text message as seen by the bot.
#[derive(Debug, Clone)]
pub struct IncomingText<'a> {
    pub text: &'a str,
    pub chat_id: i64,
    /// Forum topic id, `0` outside topics
    pub thread_id: i32,
    pub user_id: i64,
    pub topic_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct TextResponse {
    pub replies: Vec<Reply>,
    /// Remove the incoming message from the chat (used for the thread phrase)
    pub delete_incoming: bool,
}

impl TextResponse {
    fn reply(reply: Reply) -> Self {
        Self {
            replies: vec![reply],
            delete_incoming: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct CallbackOutcome {
    /// Short notice shown on the pressed button
    pub notice: Option<String>,
    pub replies: Vec<Reply>,
}

impl CallbackOutcome {
    fn notice(text: impl Into<String>) -> Self {
        Self {
            notice: Some(text.into()),
            replies: Vec::new(),
        }
    }

    fn reply(reply: Reply) -> Self {
        Self {
            notice: None,
            replies: vec![reply],
        }
    }
}

pub struct AppState {
    config: Config,
    settings: Mutex<SettingsStore>,
    session: Mutex<Session>,
    last_post: StateFile,
    last_clip: StateFile,
    alert_message: StateFile,
    alert_text: Mutex<Option<String>>,
    live: Mutex<bool>,
    twitch_auth: Mutex<TwitchAuth>,
    loops: Mutex<HashMap<Feed, Uuid>>,
    scheduler: Scheduler,
    news_tick: Mutex<()>,
    alerts_tick: Mutex<()>,
    clips_tick: Mutex<()>,
    posts: Arc<dyn PostSource>,
    streams: Arc<dyn StreamSource>,
    notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub async fn new(
        config: Config,
        settings: SettingsStore,
        posts: Arc<dyn PostSource>,
        streams: Arc<dyn StreamSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        let scheduler = Scheduler::new().await?;
        scheduler.start().await?;

        let data_dir = config.storage.data_dir.clone();
        Ok(Arc::new(Self {
            last_post: StateFile::new(&data_dir, LAST_POST_FILE),
            last_clip: StateFile::new(&data_dir, LAST_CLIP_FILE),
            alert_message: StateFile::new(&data_dir, ALERT_MESSAGE_FILE),
            config,
            settings: Mutex::new(settings),
            session: Mutex::new(Session::new()),
            alert_text: Mutex::new(None),
            live: Mutex::new(false),
            twitch_auth: Mutex::new(TwitchAuth::default()),
            loops: Mutex::new(HashMap::new()),
            scheduler,
            news_tick: Mutex::new(()),
            alerts_tick: Mutex::new(()),
            clips_tick: Mutex::new(()),
            posts,
            streams,
            notifier,
        }))
    }

    pub async fn settings(&self) -> Settings {
        self.settings.lock().await.settings()
    }

    pub async fn owner_id(&self) -> Option<i64> {
        self.settings().await.owner_id
    }

    async fn is_owner(&self, user_id: Option<i64>) -> bool {
        user_id.is_some() && self.owner_id().await == user_id
    }

    // ---- bootstrap ----

    /// Load persisted state, start every loop whose settings are complete and
    /// return the notifications for the owner.
    pub async fn startup(self: &Arc<Self>) -> Result<Vec<Reply>> {
        *self.alert_text.lock().await = self.alert_message.load().await?;

        let mut replies = vec![Reply::owner("Bot started")];
        let settings = self.settings().await;

        if settings.chat_id.is_none() {
            replies.push(
                Reply::owner(
                    "The bot is not connected to a chat yet. Add it to a group or channel to start sending notifications.",
                )
                .with_keyboard(vec![vec![Button::callback("Add chat", Callback::ChatMenu)]]),
            );
        }

        if settings.credentials().is_some() && settings.twitch_username.is_some() {
            if let Err(e) = self.twitch_session(&settings).await {
                warn!("Twitch login failed at startup: {:#}", e);
                replies.push(Reply::owner(
                    "The Twitch tokens are invalid or have expired. Update them in /settings.",
                ));
            }
        }

        self.start_enabled_loops().await?;
        replies.push(Reply::owner(self.status_summary().await));
        Ok(replies)
    }

    pub async fn start_enabled_loops(self: &Arc<Self>) -> Result<()> {
        for feed in Feed::ALL {
            self.ensure_loop(feed).await?;
        }
        Ok(())
    }

    // ---- feed loops ----

    fn interval(&self, feed: Feed) -> Duration {
        match feed {
            Feed::News => self.config.polling.news_interval(),
            Feed::Alerts => self.config.polling.alerts_interval(),
            Feed::Clips => self.config.polling.clips_interval(),
        }
    }

    fn tick_guard(&self, feed: Feed) -> &Mutex<()> {
        match feed {
            Feed::News => &self.news_tick,
            Feed::Alerts => &self.alerts_tick,
            Feed::Clips => &self.clips_tick,
        }
    }

    pub async fn is_running(&self, feed: Feed) -> bool {
        self.loops.lock().await.contains_key(&feed)
    }

    /// Start the loop for `feed` unless it is already running or its settings
    /// are incomplete. Returns whether the loop is running afterwards.
    pub async fn ensure_loop(self: &Arc<Self>, feed: Feed) -> Result<bool> {
        if !prerequisites_met(&self.settings().await, feed) {
            debug!("{} loop not started: settings incomplete", feed.describe());
            return Ok(false);
        }

        let mut loops = self.loops.lock().await;
        if loops.contains_key(&feed) {
            return Ok(true);
        }

        let weak = Arc::downgrade(self);
        let id = self
            .scheduler
            .add_interval_job(self.interval(feed), feed.slug(), move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(state) = weak.upgrade() {
                        state.run_tick(feed).await;
                    }
                })
            })
            .await?;
        loops.insert(feed, id);
        drop(loops);

        info!("{} loop started", feed.describe());
        let state = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = state.poll(feed).await {
                error!("{} tick failed: {:#}", feed.describe(), e);
            }
        });
        Ok(true)
    }

    /// Stop the loop for `feed`; stopping a loop that is not running is a no-op.
    pub async fn stop_loop(&self, feed: Feed) -> Result<()> {
        let id = self.loops.lock().await.remove(&feed);
        if let Some(id) = id {
            self.scheduler.remove_job(&id).await?;
            info!("{} loop stopped", feed.describe());
        }
        Ok(())
    }

    /// One scheduled firing. Overlapping ticks are skipped and failures are
    /// logged without affecting later ticks.
    pub async fn run_tick(&self, feed: Feed) {
        let Ok(_guard) = self.tick_guard(feed).try_lock() else {
            debug!("{} tick skipped: previous tick still running", feed.describe());
            return;
        };

        if let Err(e) = self.check(feed).await {
            error!("{} tick failed: {:#}", feed.describe(), e);
        }
    }

    /// Check `feed` once, waiting for a tick already in flight instead of
    /// skipping. Returns whether anything was sent.
    pub async fn poll(&self, feed: Feed) -> Result<bool> {
        let _guard = self.tick_guard(feed).lock().await;
        self.check(feed).await
    }

    /// Caller holds the feed's tick guard.
    async fn check(&self, feed: Feed) -> Result<bool> {
        match feed {
            Feed::News => self.check_new_post().await,
            Feed::Alerts => self.check_stream().await,
            Feed::Clips => self.check_new_clip().await,
        }
    }

    // ---- ticks ----

    /// Forward the latest channel post if it is newer than the cursor.
    /// Returns whether a post was sent.
    async fn check_new_post(&self) -> Result<bool> {
        let settings = self.settings().await;
        let (Some(to), Some(channel), Some(domain)) = (
            destination(&settings, Feed::News),
            settings.telegram_channel.as_deref(),
            settings.domain.as_deref(),
        ) else {
            return Ok(false);
        };

        let Some(post) = self.posts.latest_post(channel, domain).await? else {
            debug!("No posts in @{}", channel);
            return Ok(false);
        };
        let Some(id) = post.id() else {
            debug!("Post link without numeric id: {}", post.link);
            return Ok(false);
        };

        let last = self.last_post.load_parsed::<u64>().await?;
        if last.is_some_and(|last| id <= last) {
            return Ok(false);
        }

        platform::send_post(self.notifier.as_ref(), to, &post.text, &post.media)
            .await
            .with_context(|| format!("Failed to forward post {}", post.link))?;
        self.last_post.save(&id.to_string()).await?;
        info!("Forwarded post {} from @{}", id, channel);
        Ok(true)
    }

    /// Poll the live status and alert on the offline to live edge.
    /// Returns whether an alert was sent.
    async fn check_stream(&self) -> Result<bool> {
        let settings = self.settings().await;
        let (Some(to), Some(username)) = (
            destination(&settings, Feed::Alerts),
            settings.twitch_username.clone(),
        ) else {
            return Ok(false);
        };
        let Some(twitch) = self.twitch_session(&settings).await? else {
            return Ok(false);
        };

        let live_now = match self
            .streams
            .is_live(&twitch.user_id, &twitch.client_id, &twitch.token)
            .await
        {
            Ok(live) => live,
            Err(e) => {
                self.forget_token_on(&e).await;
                return Err(e).context("Live status unknown");
            }
        };

        let mut live = self.live.lock().await;
        if live_now == *live {
            return Ok(false);
        }
        if !live_now {
            *live = false;
            info!("{} went offline", username);
            return Ok(false);
        }

        let text = self.alert_text_for(&username).await;
        self.notifier
            .send_text(to, &text, Some(stream_button(&username)))
            .await
            .context("Failed to send stream alert")?;
        *live = true;
        info!("{} went live, alert sent", username);
        Ok(true)
    }

    /// Publish the newest clip if it was created after the cursor.
    /// Returns whether a clip was sent.
    async fn check_new_clip(&self) -> Result<bool> {
        let settings = self.settings().await;
        let Some(to) = destination(&settings, Feed::Clips) else {
            return Ok(false);
        };
        let Some(twitch) = self.twitch_session(&settings).await? else {
            return Ok(false);
        };

        let since = Utc::now() - chrono::Duration::hours(self.config.twitch.clip_lookback_hours);
        let clip = match self
            .streams
            .latest_clip(&twitch.user_id, &twitch.client_id, &twitch.token, since)
            .await
        {
            Ok(clip) => clip,
            Err(e) => {
                self.forget_token_on(&e).await;
                return Err(e).context("Failed to fetch clips");
            }
        };
        let Some(clip) = clip else {
            return Ok(false);
        };

        let last = self.last_clip.load_parsed::<i64>().await?;
        if last.is_some_and(|last| clip.created_at <= last) {
            return Ok(false);
        }

        self.notifier
            .send_text(
                to,
                &clip_card(&clip),
                Some(LinkButton::new("Watch the clip", clip.url.clone())),
            )
            .await
            .context("Failed to send clip")?;
        self.last_clip.save(&clip.created_at.to_string()).await?;
        info!("Published clip {}", clip.url);
        Ok(true)
    }

    // ---- twitch ----

    /// Token and broadcaster id, acquiring whichever is not cached yet.
    /// `None` when credentials or the channel name are not configured.
    async fn twitch_session(&self, settings: &Settings) -> Result<Option<TwitchSession>> {
        let (Some((client_id, client_secret)), Some(login)) =
            (settings.credentials(), settings.twitch_username.as_deref())
        else {
            return Ok(None);
        };

        let mut auth = self.twitch_auth.lock().await;
        let token = match &auth.access_token {
            Some(token) => token.clone(),
            None => {
                let token = self
                    .streams
                    .access_token(client_id, client_secret)
                    .await
                    .context("Failed to get a Twitch access token")?;
                debug!("Acquired a new Twitch access token");
                auth.access_token = Some(token.clone());
                token
            }
        };

        let user_id = match &auth.broadcaster {
            Some((cached, id)) if cached == login => id.clone(),
            _ => match self.streams.user_id(login, client_id, &token).await {
                Ok(Some(id)) => {
                    auth.broadcaster = Some((login.to_string(), id.clone()));
                    id
                }
                Ok(None) => anyhow::bail!("Twitch user {} not found", login),
                Err(e) => {
                    if matches!(e, TwitchError::Unauthorized) {
                        auth.access_token = None;
                    }
                    return Err(e).context("Failed to look up the Twitch user");
                }
            },
        };

        Ok(Some(TwitchSession {
            client_id: client_id.to_string(),
            token,
            user_id,
        }))
    }

    async fn forget_token_on(&self, e: &TwitchError) {
        if matches!(e, TwitchError::Unauthorized) {
            warn!("Twitch token rejected, a new one will be requested");
            self.twitch_auth.lock().await.access_token = None;
        }
    }

    async fn alert_text_for(&self, username: &str) -> String {
        self.alert_text
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| default_alert_text(username))
    }

    // ---- commands ----

    /// Greet the sender; the first user to run `/start` becomes the owner.
    pub async fn cmd_start(&self, user_id: Option<i64>) -> Result<Reply> {
        let greeting = "Hi! I mirror posts from a Telegram channel and announce Twitch streams and clips.\nSend /help to see what I can do.";
        if let Some(id) = user_id {
            let mut store = self.settings.lock().await;
            if store.settings().owner_id.is_none() {
                store
                    .set(SettingKey::OwnerId, Some(id.to_string().as_str()))
                    .await?;
                info!("Owner set to {}", id);
                return Ok(Reply::here(format!(
                    "{}\n\nYou are now the owner of this bot. Open /settings to set it up.",
                    greeting
                )));
            }
        }
        Ok(Reply::here(greeting))
    }

    pub async fn cmd_info(&self) -> Reply {
        Reply::here(self.status_summary().await)
    }

    async fn status_summary(&self) -> String {
        let settings = self.settings().await;

        let chat = match settings.chat_id {
            Some(id) => format!("{} ({})", id, settings.chat_kind().as_str()),
            None => "not set".to_string(),
        };
        let mut lines = vec![format!("Chat: {}", chat)];
        for feed in Feed::ALL {
            let state = if self.is_running(feed).await { "on" } else { "off" };
            lines.push(format!("{}: {}", feed.describe(), state));
        }
        lines.push(format!(
            "Tracked channel: {}",
            settings
                .telegram_channel
                .as_deref()
                .map(|c| format!("@{}", c))
                .unwrap_or_else(|| "not set".to_string())
        ));
        lines.push(format!(
            "Twitch channel: {}",
            settings.twitch_username.as_deref().unwrap_or("not set")
        ));
        lines.join("\n")
    }

    /// Upload today's log file to the owner.
    pub async fn cmd_log(&self) -> Result<Reply> {
        let Some(owner) = self.owner_id().await else {
            return Ok(Reply::here("The bot has no owner yet. Send /start first."));
        };

        let path = logging::today_log_file(&self.config.storage.logs_dir);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Reply::owner(format!(
                "Today's log file was not found: {}",
                path.display()
            )));
        }

        self.notifier
            .send_document(Destination::chat(owner), &path)
            .await
            .context("Failed to upload the log file")?;
        Ok(Reply::here("The log file has been sent to the owner."))
    }

    pub async fn cmd_settings(&self, user_id: Option<i64>) -> Reply {
        if !self.is_owner(user_id).await {
            return Reply::here("Only the bot owner can change settings.");
        }
        self.session.lock().await.cancel();
        let (text, keyboard) = menu::main_menu();
        Reply::here(text).with_keyboard(keyboard)
    }

    pub async fn cmd_cancel(&self) -> Reply {
        let mut session = self.session.lock().await;
        if session.pending().is_idle() {
            return Reply::here("Nothing to cancel.");
        }
        session.cancel();
        Reply::here("Action cancelled.")
    }

    pub async fn test_alert(&self) -> Result<Reply> {
        let settings = self.settings().await;
        let Some(to) = destination(&settings, Feed::Alerts) else {
            return Ok(Reply::here(
                "Stream alerts are off. Choose a thread for them in /settings.",
            ));
        };

        let username = settings.twitch_username.as_deref().unwrap_or("twitch");
        let text = match self.alert_text.lock().await.clone() {
            Some(text) => text,
            None => format!(
                "Test alert: <b>{}</b> stream notifications work.",
                html::escape(username)
            ),
        };
        self.notifier
            .send_text(to, &text, Some(stream_button(username)))
            .await
            .context("Failed to send test alert")?;
        Ok(Reply::here("Test alert sent."))
    }

    pub async fn test_news(&self) -> Result<Reply> {
        let settings = self.settings().await;
        let Some(to) = destination(&settings, Feed::News) else {
            return Ok(Reply::here(
                "Post forwarding is off. Choose a thread for it in /settings.",
            ));
        };

        platform::send_post(
            self.notifier.as_ref(),
            to,
            "Test post: forwarding works.",
            &[],
        )
        .await
        .context("Failed to send test post")?;
        Ok(Reply::here("Test post sent."))
    }

    // ---- buttons ----

    pub async fn on_callback(
        self: &Arc<Self>,
        user_id: i64,
        data: &str,
    ) -> Result<CallbackOutcome> {
        let Some(callback) = Callback::parse(data) else {
            warn!("Unknown callback: {}", data);
            return Ok(CallbackOutcome::notice(format!("Unknown action: {}", data)));
        };
        if !self.is_owner(Some(user_id)).await {
            return Ok(CallbackOutcome::notice(
                "Only the bot owner can change settings.",
            ));
        }
        debug!("Callback {}", callback);

        let reply = match callback {
            Callback::Settings => {
                self.session.lock().await.cancel();
                let (text, keyboard) = menu::main_menu();
                Reply::edit(text).with_keyboard(keyboard)
            }
            Callback::ForwardMenu => {
                self.session.lock().await.cancel();
                self.forward_menu().await
            }
            Callback::ChatMenu => {
                self.session.lock().await.cancel();
                self.chat_menu().await
            }
            Callback::TwitchMenu => {
                self.session.lock().await.cancel();
                self.twitch_menu().await
            }
            Callback::ForwardChannel => {
                self.prompt(
                    PendingAction::AwaitingChannelLink,
                    "Send a link to the channel whose posts should be forwarded, e.g. https://t.me/channel",
                    back(Callback::ForwardMenu),
                )
                .await
            }
            Callback::ForwardDomain => {
                let mut keyboard = vec![vec![Button::callback(
                    "Use the official instance",
                    Callback::ForwardOfficialDomain,
                )]];
                keyboard.extend(back(Callback::ForwardMenu));
                self.prompt(
                    PendingAction::AwaitingRssDomain,
                    "Send the address of your RSS-bridge instance, e.g. 127.0.0.1:3000",
                    keyboard,
                )
                .await
            }
            Callback::ForwardOfficialDomain => {
                self.session.lock().await.cancel();
                let domain = self.config.rss.default_domain.clone();
                self.settings
                    .lock()
                    .await
                    .set(SettingKey::Domain, Some(domain.as_str()))
                    .await?;
                self.ensure_loop(Feed::News).await?;
                self.forward_menu().await
            }
            Callback::ChangeChat(kind) => {
                let text = match kind {
                    ChatKind::Group => "Add the bot to the group that should receive notifications.",
                    ChatKind::Channel => {
                        "Add the bot to the channel as an administrator, or forward any post from that channel here."
                    }
                };
                self.prompt(
                    PendingAction::AwaitingChatForward(kind),
                    text,
                    back(Callback::ChatMenu),
                )
                .await
            }
            Callback::ConfirmChat => {
                let Some(chat) = self.session.lock().await.confirm_chat() else {
                    return Ok(CallbackOutcome::notice("Nothing to confirm."));
                };
                self.switch_chat(&chat).await?;
                let (_, keyboard) = menu::chat_menu(&self.settings().await);
                Reply::edit(format!(
                    "Chat \"{}\" saved. Choose threads for the notifications.",
                    chat.title
                ))
                .with_keyboard(keyboard)
            }
            Callback::RejectChat => {
                if !self.session.lock().await.reject_chat() {
                    return Ok(CallbackOutcome::notice("Nothing to reject."));
                }
                Reply::edit("Add the bot to the right chat, or forward a post from the right channel.")
            }
            Callback::Thread(feed, ThreadAction::On) => self.thread_on(feed).await?,
            Callback::Thread(feed, ThreadAction::Off) => self.thread_off(feed).await?,
            Callback::Thread(feed, ThreadAction::Confirm) => {
                let Some(thread_id) = self.session.lock().await.confirm_thread(feed) else {
                    return Ok(CallbackOutcome::notice("Nothing to confirm."));
                };
                self.settings
                    .lock()
                    .await
                    .set(feed.thread_key(), Some(thread_id.to_string().as_str()))
                    .await?;
                let running = self.ensure_loop(feed).await?;
                let (_, keyboard) = menu::chat_menu(&self.settings().await);
                let status = if running { "on" } else { "waiting for the remaining settings" };
                Reply::edit(format!(
                    "Thread {} saved. {}: {}.",
                    thread_id,
                    feed.describe(),
                    status
                ))
                .with_keyboard(keyboard)
            }
            Callback::Thread(feed, ThreadAction::Reject) => {
                let mut session = self.session.lock().await;
                if session.pending() != PendingAction::AwaitingThreadConfirmation(feed) {
                    return Ok(CallbackOutcome::notice("Nothing to reject."));
                }
                let phrase = session.issue_phrase(feed);
                phrase_prompt(feed, &phrase)
            }
            Callback::TwitchChannel => {
                self.prompt(
                    PendingAction::AwaitingTwitchUsername,
                    "Send the name of the Twitch channel to follow.",
                    back(Callback::TwitchMenu),
                )
                .await
            }
            Callback::TwitchTokens => {
                let mut keyboard = vec![vec![Button::link(
                    "Twitch developer console",
                    TWITCH_CONSOLE_URL,
                )]];
                keyboard.extend(back(Callback::TwitchMenu));
                self.prompt(
                    PendingAction::AwaitingClientId,
                    "Send the Client ID of your Twitch application.",
                    keyboard,
                )
                .await
            }
            Callback::TwitchAlertText => {
                self.prompt(
                    PendingAction::AwaitingAlertText,
                    "Send the text of the go-live alert. HTML formatting is allowed.",
                    back(Callback::TwitchMenu),
                )
                .await
            }
        };
        Ok(CallbackOutcome::reply(reply))
    }

    async fn prompt(&self, action: PendingAction, text: &str, keyboard: Keyboard) -> Reply {
        self.session.lock().await.begin(action);
        Reply::edit(text).with_keyboard(keyboard)
    }

    async fn forward_menu(&self) -> Reply {
        let (text, keyboard) = menu::forward_menu(&self.settings().await);
        Reply::edit(text).with_keyboard(keyboard)
    }

    async fn chat_menu(&self) -> Reply {
        let (text, keyboard) = menu::chat_menu(&self.settings().await);
        Reply::edit(text).with_keyboard(keyboard)
    }

    async fn twitch_menu(&self) -> Reply {
        let alert_text = self.alert_text.lock().await.clone();
        let (text, keyboard) = menu::twitch_menu(&self.settings().await, alert_text.as_deref());
        Reply::edit(text).html().with_keyboard(keyboard)
    }

    async fn thread_on(self: &Arc<Self>, feed: Feed) -> Result<Reply> {
        let settings = self.settings().await;
        if let Some(guidance) = missing_prerequisite(&settings, feed) {
            return Ok(guidance);
        }

        if settings.chat_kind() == ChatKind::Channel {
            self.settings
                .lock()
                .await
                .set(feed.thread_key(), Some("0"))
                .await?;
            self.ensure_loop(feed).await?;
            let (_, keyboard) = menu::chat_menu(&self.settings().await);
            return Ok(Reply::edit(format!("{}: on.", feed.describe())).with_keyboard(keyboard));
        }

        let phrase = self.session.lock().await.issue_phrase(feed);
        Ok(phrase_prompt(feed, &phrase))
    }

    async fn thread_off(&self, feed: Feed) -> Result<Reply> {
        {
            let mut session = self.session.lock().await;
            if matches!(
                session.pending(),
                PendingAction::AwaitingThreadPhrase(f) | PendingAction::AwaitingThreadConfirmation(f) if f == feed
            ) {
                session.cancel();
            }
        }

        self.stop_loop(feed).await?;
        // A tick already in flight finishes before the cursor goes.
        let _tick = self.tick_guard(feed).lock().await;
        self.settings
            .lock()
            .await
            .set(feed.thread_key(), None)
            .await?;
        match feed {
            Feed::News => self.last_post.clear().await?,
            Feed::Clips => self.last_clip.clear().await?,
            Feed::Alerts => *self.live.lock().await = false,
        }

        let (_, keyboard) = menu::chat_menu(&self.settings().await);
        Ok(Reply::edit(format!("{}: off.", feed.describe())).with_keyboard(keyboard))
    }

    /// Point every feed at a new chat. Threads and cursors belong to the old
    /// chat and are dropped.
    async fn switch_chat(&self, chat: &CandidateChat) -> Result<()> {
        for feed in Feed::ALL {
            self.stop_loop(feed).await?;
        }
        let _news = self.news_tick.lock().await;
        let _alerts = self.alerts_tick.lock().await;
        let _clips = self.clips_tick.lock().await;

        let chat_id = chat.id.to_string();
        self.settings
            .lock()
            .await
            .update(&[
                (SettingKey::ChatId, Some(chat_id.as_str())),
                (SettingKey::TypeChat, Some(chat.kind.as_str())),
                (SettingKey::ThreadAlertsId, None),
                (SettingKey::ThreadNewsId, None),
                (SettingKey::ThreadClipsId, None),
            ])
            .await?;
        self.last_post.clear().await?;
        self.last_clip.clear().await?;
        *self.live.lock().await = false;
        info!("Target chat changed to {} ({})", chat.id, chat.kind.as_str());
        Ok(())
    }

    // ---- chat events ----

    /// The bot was added to a chat or the owner forwarded a channel post.
    pub async fn on_chat_candidate(&self, user_id: i64, chat: CandidateChat) -> Option<Reply> {
        if !self.is_owner(Some(user_id)).await {
            return None;
        }
        if !self.session.lock().await.offer_chat(chat.clone()) {
            return None;
        }

        info!("Candidate chat {} ({})", chat.id, chat.title);
        Some(
            Reply::owner(format!(
                "Chat: {}\nID: {}\n\nIs this the right chat?",
                chat.title, chat.id
            ))
            .with_keyboard(menu::confirm_keyboard(
                Callback::ConfirmChat,
                Callback::RejectChat,
                "No, wait for another chat",
            )),
        )
    }

    pub async fn on_text(self: &Arc<Self>, msg: IncomingText<'_>) -> Result<TextResponse> {
        let settings = self.settings().await;
        let input = TextInput {
            text: msg.text,
            chat_id: msg.chat_id,
            thread_id: msg.thread_id,
            from_owner: settings.owner_id == Some(msg.user_id),
            target_chat: settings.chat_id,
        };
        let outcome = self.session.lock().await.on_text(input);

        let reply = match outcome {
            TextOutcome::Ignored => return Ok(TextResponse::default()),
            TextOutcome::Invalid(rejection) => Reply::here(rejection.message()),
            TextOutcome::ChannelLink(name) => {
                self.settings
                    .lock()
                    .await
                    .set(SettingKey::TelegramChannel, Some(name.as_str()))
                    .await?;
                self.last_post.clear().await?;
                self.ensure_loop(Feed::News).await?;
                let (text, keyboard) = menu::forward_menu(&self.settings().await);
                Reply::here(format!("Channel @{} saved.\n\n{}", name, text)).with_keyboard(keyboard)
            }
            TextOutcome::RssDomain(domain) => {
                self.settings
                    .lock()
                    .await
                    .set(SettingKey::Domain, Some(domain.as_str()))
                    .await?;
                self.ensure_loop(Feed::News).await?;
                let (text, keyboard) = menu::forward_menu(&self.settings().await);
                Reply::here(format!("RSS-bridge address saved.\n\n{}", text)).with_keyboard(keyboard)
            }
            TextOutcome::TwitchUsername(username) => self.apply_twitch_username(&username).await?,
            TextOutcome::ClientIdAccepted => {
                Reply::here("Client ID received. Now send the Client Secret.")
            }
            TextOutcome::Credentials {
                client_id,
                client_secret,
            } => self.apply_credentials(&client_id, &client_secret).await?,
            TextOutcome::AlertText(text) => {
                self.alert_message.save(&text).await?;
                *self.alert_text.lock().await = Some(text);
                info!("Alert text updated");
                let mut reply = self.twitch_menu().await;
                reply.target = menu::ReplyTarget::Here;
                reply.text = format!("Alert text saved.\n\n{}", reply.text);
                reply
            }
            TextOutcome::ThreadCaptured { feed, thread_id } => {
                let name = msg.topic_name.unwrap_or_else(|| "General".to_string());
                info!("Thread {} captured for {}", thread_id, feed.describe());
                let reply = Reply::owner(format!(
                    "Thread: {}\nID: {}\n\nSend {} here?",
                    name,
                    thread_id,
                    feed.describe().to_lowercase()
                ))
                .with_keyboard(menu::confirm_keyboard(
                    Callback::Thread(feed, ThreadAction::Confirm),
                    Callback::Thread(feed, ThreadAction::Reject),
                    "No, give me a new phrase",
                ));
                return Ok(TextResponse {
                    replies: vec![reply],
                    delete_incoming: true,
                });
            }
        };
        Ok(TextResponse::reply(reply))
    }

    async fn apply_twitch_username(self: &Arc<Self>, username: &str) -> Result<Reply> {
        self.settings
            .lock()
            .await
            .set(SettingKey::TwitchUsername, Some(username))
            .await?;
        self.twitch_auth.lock().await.broadcaster = None;
        *self.live.lock().await = false;

        let settings = self.settings().await;
        let mut text = format!("Twitch channel {} saved.", username);
        if let Err(e) = self.twitch_session(&settings).await {
            warn!("Twitch user lookup failed: {:#}", e);
            text.push_str(&format!(" It could not be checked on Twitch yet: {}", e));
        }
        for feed in [Feed::Alerts, Feed::Clips] {
            self.ensure_loop(feed).await?;
        }
        Ok(Reply::here(text).with_keyboard(back(Callback::TwitchMenu)))
    }

    /// Verify the credentials with Twitch before persisting them.
    async fn apply_credentials(
        self: &Arc<Self>,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Reply> {
        let token = match self.streams.access_token(client_id, client_secret).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Twitch rejected the new credentials: {}", e);
                self.session.lock().await.retry_credentials();
                return Ok(Reply::here(format!(
                    "Twitch did not accept these tokens ({}).\n\nSend the Client ID again.",
                    e
                )));
            }
        };

        self.settings
            .lock()
            .await
            .update(&[
                (SettingKey::ClientId, Some(client_id)),
                (SettingKey::ClientSecret, Some(client_secret)),
            ])
            .await?;
        *self.twitch_auth.lock().await = TwitchAuth {
            access_token: Some(token),
            broadcaster: None,
        };
        self.session.lock().await.finish();
        info!("Twitch credentials updated");

        for feed in [Feed::Alerts, Feed::Clips] {
            self.ensure_loop(feed).await?;
        }
        Ok(Reply::here("Twitch tokens saved.").with_keyboard(back(Callback::TwitchMenu)))
    }
}

/// Chat id plus the configured thread, when the feed has both.
fn destination(settings: &Settings, feed: Feed) -> Option<Destination> {
    Some(Destination::new(settings.chat_id?, settings.thread(feed)?))
}

fn sources_configured(settings: &Settings, feed: Feed) -> bool {
    match feed {
        Feed::News => settings.telegram_channel.is_some() && settings.domain.is_some(),
        Feed::Alerts | Feed::Clips => {
            settings.credentials().is_some() && settings.twitch_username.is_some()
        }
    }
}

pub fn prerequisites_met(settings: &Settings, feed: Feed) -> bool {
    destination(settings, feed).is_some() && sources_configured(settings, feed)
}

/// Guidance shown when a feed is switched on before its settings exist.
fn missing_prerequisite(settings: &Settings, feed: Feed) -> Option<Reply> {
    let (text, button) = if settings.chat_id.is_none() {
        (
            "Connect a group or channel first.",
            Button::callback("Chat settings", Callback::ChatMenu),
        )
    } else if sources_configured(settings, feed) {
        return None;
    } else if feed.needs_twitch() {
        (
            "Set the Twitch channel and tokens first.",
            Button::callback("Twitch settings", Callback::TwitchMenu),
        )
    } else {
        (
            "Set the channel and the RSS-bridge address first.",
            Button::callback("Post forwarding settings", Callback::ForwardMenu),
        )
    };
    Some(Reply::edit(text).with_keyboard(vec![vec![button]]))
}

fn phrase_prompt(feed: Feed, phrase: &str) -> Reply {
    Reply::edit(format!(
        "Send this phrase to the thread where {} should go:\n\n<code>{}</code>",
        feed.describe().to_lowercase(),
        phrase
    ))
    .html()
    .with_keyboard(vec![
        vec![menu::turn_off_button(feed, "Turn off")],
        vec![Button::callback("Back", Callback::ChatMenu)],
    ])
}

fn back(to: Callback) -> Keyboard {
    vec![vec![Button::callback("Back", to)]]
}

fn stream_button(username: &str) -> LinkButton {
    LinkButton::new(
        "Watch the stream",
        format!("https://www.twitch.tv/{}", username),
    )
}

pub fn default_alert_text(username: &str) -> String {
    format!("Hi! {} has started streaming.", html::escape(username))
}

pub fn clip_card(clip: &Clip) -> String {
    format!(
        "Clip: <a href=\"{}\">{}</a>\nAuthor: {}",
        clip.url,
        html::escape(&clip.title),
        html::escape(&clip.creator)
    )
}
