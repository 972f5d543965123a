use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use teloxide::dispatching::ShutdownToken;
use teloxide::error_handlers::ErrorHandler;
use teloxide::prelude::*;
use teloxide::types::{
    ChatMemberUpdated, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia,
    InputMediaPhoto, InputMediaVideo, MessageId, MessageOrigin, ParseMode, ThreadId,
};
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

use super::{Destination, LinkButton, Notifier};
use crate::app::{AppState, IncomingText};
use crate::menu::{Button, Keyboard, Reply, ReplyTarget};
use crate::session::CandidateChat;
use crate::sources::{MediaItem, MediaKind};
use crate::store::{ChatKind, SettingKey, SettingsStore};

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "start the bot")]
    Start,
    #[command(description = "show this list")]
    Help,
    #[command(description = "show what the bot is doing")]
    Info,
    #[command(description = "send today's log file to the owner")]
    Log,
    #[command(description = "open the settings menu")]
    Settings,
    #[command(description = "cancel the current action")]
    Cancel,
    #[command(description = "send a test stream alert")]
    TestAlerts,
    #[command(description = "send a test post")]
    TestNews,
    #[command(description = "stop the bot")]
    Stop,
}

/// Filled with the dispatcher's shutdown token once it is built.
#[derive(Clone, Default)]
struct StopHandle(Arc<OnceLock<ShutdownToken>>);

/// Sends feed notifications through the Bot API.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(
        &self,
        to: Destination,
        text: &str,
        button: Option<LinkButton>,
    ) -> Result<()> {
        let mut request = self
            .bot
            .send_message(ChatId(to.chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(thread) = to.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        if let Some(button) = button.and_then(link_button) {
            request = request.reply_markup(InlineKeyboardMarkup::new(vec![vec![button]]));
        }
        request.await.context("Failed to send message")?;
        Ok(())
    }

    async fn send_media_group(
        &self,
        to: Destination,
        media: &[MediaItem],
        caption: Option<&str>,
    ) -> Result<()> {
        let files: Vec<(MediaKind, InputFile)> = media
            .iter()
            .filter_map(|item| match reqwest::Url::parse(&item.url) {
                Ok(url) => Some((item.kind, InputFile::url(url))),
                Err(e) => {
                    warn!("Skipping media with bad URL {}: {}", item.url, e);
                    None
                }
            })
            .collect();
        if files.is_empty() {
            anyhow::bail!("No usable media in the post");
        }

        let group: Vec<InputMedia> = files
            .into_iter()
            .enumerate()
            .map(|(i, (kind, file))| {
                let caption = caption.filter(|_| i == 0);
                match kind {
                    MediaKind::Photo => {
                        let mut photo = InputMediaPhoto::new(file);
                        if let Some(caption) = caption {
                            photo = photo.caption(caption).parse_mode(ParseMode::Html);
                        }
                        InputMedia::Photo(photo)
                    }
                    MediaKind::Video => {
                        let mut video = InputMediaVideo::new(file);
                        if let Some(caption) = caption {
                            video = video.caption(caption).parse_mode(ParseMode::Html);
                        }
                        InputMedia::Video(video)
                    }
                }
            })
            .collect();

        let mut request = self.bot.send_media_group(ChatId(to.chat_id), group);
        if let Some(thread) = to.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        request.await.context("Failed to send media group")?;
        Ok(())
    }

    async fn send_document(&self, to: Destination, path: &Path) -> Result<()> {
        self.bot
            .send_document(ChatId(to.chat_id), InputFile::file(path.to_path_buf()))
            .await
            .with_context(|| format!("Failed to send {}", path.display()))?;
        Ok(())
    }
}

/// Reports handler errors to the owner chat; the dispatcher keeps running.
struct OwnerErrorReporter {
    bot: Bot,
    state: Arc<AppState>,
}

impl ErrorHandler<anyhow::Error> for OwnerErrorReporter {
    fn handle_error(self: Arc<Self>, error: anyhow::Error) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            error!("Unhandled error: {:#}", error);
            if let Some(owner) = self.state.owner_id().await {
                if let Err(e) = self
                    .bot
                    .send_message(ChatId(owner), format!("Unhandled error: {}", error))
                    .await
                {
                    warn!("Failed to report error to owner: {}", e);
                }
            }
        })
    }
}

/// Make sure `BOT_TOKEN` is set, moving it over from the token file on first
/// launch. Returns `None` when the bot cannot start.
pub async fn bootstrap_token(store: &mut SettingsStore, token_file: &Path) -> Result<Option<String>> {
    if let Some(token) = store.get(SettingKey::BotToken) {
        return Ok(Some(token.to_string()));
    }

    let token = match tokio::fs::read_to_string(token_file).await {
        Ok(content) => content.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "No bot token configured. Put the token from @BotFather into {} and restart",
                token_file.display()
            );
            return Ok(None);
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read token file: {}", token_file.display()))
        }
    };
    if token.is_empty() {
        warn!("Token file {} is empty", token_file.display());
        return Ok(None);
    }

    match Bot::new(&token).get_me().await {
        Ok(me) => {
            info!("Token accepted for @{}", me.username());
            store.set(SettingKey::BotToken, Some(token.as_str())).await?;
            tokio::fs::remove_file(token_file)
                .await
                .with_context(|| format!("Failed to remove {}", token_file.display()))?;
            Ok(Some(token))
        }
        Err(e) => {
            error!("Invalid bot token in {}: {}", token_file.display(), e);
            Ok(None)
        }
    }
}

/// Run the Telegram bot platform
pub async fn run(bot: Bot, state: Arc<AppState>) -> Result<()> {
    info!("Starting Telegram platform...");

    match state.startup().await {
        Ok(replies) => {
            let owner = state.owner_id().await;
            for reply in replies {
                if let Err(e) = deliver(&bot, owner, None, None, reply).await {
                    warn!("Failed to send startup notice: {:#}", e);
                }
            }
        }
        Err(e) => error!("Startup failed: {:#}", e),
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(dptree::endpoint(handle_message)),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(Update::filter_my_chat_member().endpoint(handle_my_chat_member));

    let stop = StopHandle::default();
    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state.clone(), stop.clone()])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(Arc::new(OwnerErrorReporter { bot, state }))
        .build();
    let _ = stop.0.set(dispatcher.shutdown_token());

    dispatcher.dispatch().await;
    info!("Dispatcher stopped");
    Ok(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<AppState>,
    stop: StopHandle,
) -> Result<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64);
    info!("Command {:?} from {:?} in {}", cmd, user_id, msg.chat.id);

    let reply = match cmd {
        Command::Start => state.cmd_start(user_id).await?,
        Command::Help => Reply::here(Command::descriptions().to_string()),
        Command::Info => state.cmd_info().await,
        Command::Log => state.cmd_log().await?,
        Command::Settings => state.cmd_settings(user_id).await,
        Command::Cancel => state.cmd_cancel().await,
        Command::TestAlerts => state.test_alert().await?,
        Command::TestNews => state.test_news().await?,
        Command::Stop => {
            if !may_stop(&bot, &state, user_id).await? {
                Reply::here("Only an administrator of the bot's chat can stop it.")
            } else {
                let owner = state.owner_id().await;
                deliver(&bot, owner, Some(msg.chat.id), None, Reply::owner("Bot stopped.")).await?;
                let Some(token) = stop.0.get().cloned() else {
                    warn!("Shutdown token not ready");
                    return Ok(());
                };
                info!("Stop requested by {:?}", user_id);
                // Shutdown waits for running handlers, this one included.
                tokio::spawn(async move {
                    match token.shutdown() {
                        Ok(shutdown) => shutdown.await,
                        Err(e) => warn!("Dispatcher is not running: {:?}", e),
                    }
                });
                return Ok(());
            }
        }
    };

    let owner = state.owner_id().await;
    deliver(&bot, owner, Some(msg.chat.id), None, reply).await
}

/// Administrators of the configured chat may stop the bot; before a chat is
/// set only the owner may.
async fn may_stop(bot: &Bot, state: &AppState, user_id: Option<i64>) -> Result<bool> {
    let Some(user_id) = user_id else {
        return Ok(false);
    };
    let settings = state.settings().await;
    match settings.chat_id {
        Some(chat_id) => {
            let admins = bot
                .get_chat_administrators(ChatId(chat_id))
                .await
                .context("Failed to fetch chat administrators")?;
            Ok(admins.iter().any(|m| m.user.id.0 as i64 == user_id))
        }
        None => Ok(settings.owner_id == Some(user_id)),
    }
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    let owner = state.owner_id().await;

    if let Some(MessageOrigin::Channel { chat, .. }) = msg.forward_origin() {
        let candidate = CandidateChat {
            id: chat.id.0,
            title: chat.title().unwrap_or_default().to_string(),
            kind: ChatKind::Channel,
        };
        if let Some(reply) = state.on_chat_candidate(user_id, candidate).await {
            deliver(&bot, owner, Some(msg.chat.id), None, reply).await?;
        }
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };
    let thread_id = if msg.is_topic_message {
        msg.thread_id.map(|t| t.0 .0).unwrap_or(0)
    } else {
        0
    };
    let topic_name = msg
        .reply_to_message()
        .and_then(|m| m.forum_topic_created())
        .map(|t| t.name.clone());

    let response = state
        .on_text(IncomingText {
            text,
            chat_id: msg.chat.id.0,
            thread_id,
            user_id,
            topic_name,
        })
        .await?;

    if response.delete_incoming {
        if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
            warn!("Failed to delete message {}: {}", msg.id.0, e);
        }
    }
    for reply in response.replies {
        deliver(&bot, owner, Some(msg.chat.id), None, reply).await?;
    }
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> Result<()> {
    let data = q.data.clone().unwrap_or_default();
    let user_id = q.from.id.0 as i64;
    let outcome = state.on_callback(user_id, &data).await?;

    let mut answer = bot.answer_callback_query(q.id.clone());
    if let Some(notice) = outcome.notice {
        answer = answer.text(notice);
    }
    answer.await?;

    let origin = q.regular_message();
    let here = origin.map(|m| m.chat.id).unwrap_or(ChatId(user_id));
    let owner = state.owner_id().await;
    for reply in outcome.replies {
        deliver(&bot, owner, Some(here), origin.map(|m| m.id), reply).await?;
    }
    Ok(())
}

async fn handle_my_chat_member(
    bot: Bot,
    update: ChatMemberUpdated,
    state: Arc<AppState>,
) -> Result<()> {
    if update.chat.is_private() || !update.new_chat_member.kind.is_present() {
        return Ok(());
    }

    let kind = if update.chat.is_channel() {
        ChatKind::Channel
    } else {
        ChatKind::Group
    };
    info!("Added to {} {}", kind.as_str(), update.chat.id);

    let candidate = CandidateChat {
        id: update.chat.id.0,
        title: update.chat.title().unwrap_or_default().to_string(),
        kind,
    };
    if let Some(reply) = state
        .on_chat_candidate(update.from.id.0 as i64, candidate)
        .await
    {
        let owner = state.owner_id().await;
        deliver(&bot, owner, None, None, reply).await?;
    }
    Ok(())
}

/// Send one reply: into `here`, as an edit of `origin`, or to the owner.
async fn deliver(
    bot: &Bot,
    owner: Option<i64>,
    here: Option<ChatId>,
    origin: Option<MessageId>,
    reply: Reply,
) -> Result<()> {
    let markup = reply.keyboard.as_ref().map(to_markup);

    if let (ReplyTarget::EditOrigin, Some(chat), Some(message)) = (reply.target, here, origin) {
        let mut request = bot.edit_message_text(chat, message, &reply.text);
        if reply.html {
            request = request.parse_mode(ParseMode::Html);
        }
        if let Some(markup) = markup {
            request = request.reply_markup(markup);
        }
        if let Err(e) = request.await {
            warn!("Failed to edit message {}: {}", message.0, e);
        }
        return Ok(());
    }

    let chat = match reply.target {
        ReplyTarget::Owner => owner.map(ChatId),
        ReplyTarget::Here | ReplyTarget::EditOrigin => here.or(owner.map(ChatId)),
    };
    let Some(chat) = chat else {
        warn!("No chat to deliver reply to: {}", reply.text);
        return Ok(());
    };

    let mut request = bot.send_message(chat, &reply.text);
    if reply.html {
        request = request.parse_mode(ParseMode::Html);
    }
    if let Some(markup) = markup {
        request = request.reply_markup(markup);
    }
    request.await.context("Failed to send reply")?;
    Ok(())
}

fn to_markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.iter().map(|row| {
        row.iter()
            .filter_map(|button| match button {
                Button::Callback { text, data } => {
                    Some(InlineKeyboardButton::callback(text.clone(), data.clone()))
                }
                Button::Link { text, url } => link_button(LinkButton::new(text.clone(), url.clone())),
            })
            .collect::<Vec<_>>()
    }))
}

fn link_button(button: LinkButton) -> Option<InlineKeyboardButton> {
    match reqwest::Url::parse(&button.url) {
        Ok(url) => Some(InlineKeyboardButton::url(button.text, url)),
        Err(e) => {
            warn!("Dropping button with bad URL {}: {}", button.url, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::Callback;

    #[test]
    fn test_command_names() {
        let descriptions = Command::descriptions().to_string();
        for name in ["/testalerts", "/testnews", "/settings", "/stop"] {
            assert!(descriptions.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_keyboard_conversion_drops_bad_links() {
        let keyboard = vec![
            vec![Button::callback("Twitch", Callback::TwitchMenu)],
            vec![
                Button::link("Watch", "https://www.twitch.tv/streamer"),
                Button::link("Broken", "not a url"),
            ],
        ];
        let markup = to_markup(&keyboard);
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(markup.inline_keyboard[1].len(), 1);
    }
}
