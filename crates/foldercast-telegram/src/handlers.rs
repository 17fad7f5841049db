//! Telegram update handlers: command dispatch plus the folder picker
//! callbacks. Handlers validate input, call into the registry and render
//! replies through `view`; orchestration stays in `foldercast-core`.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
};
use tracing::warn;

use foldercast_core::{
    domain::{FolderId, UserId},
    errors::Error,
    session::AuthStatus,
};

use crate::router::AppState;
use crate::view::{self, Button, Callback};

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn markup(rows: Vec<Vec<Button>>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.into_iter().map(|row| {
        row.into_iter()
            .map(|(label, data)| InlineKeyboardButton::callback(label, data))
            .collect::<Vec<_>>()
    }))
}

/// Renders a user-facing line for an orchestration error.
fn describe_error(err: &Error) -> String {
    match err {
        Error::Auth(_) | Error::AuthLost => {
            "Your account is not linked. Use /auth first.".to_string()
        }
        Error::BreakerOpen => {
            "The connection is temporarily paused after repeated failures. Try again in a few minutes.".to_string()
        }
        Error::NotFound(what) => format!("Not found: {what}."),
        Error::RateLimited { retry_after } => format!(
            "Rate limited. Try again in {}s.",
            retry_after.as_secs().max(1)
        ),
        _ => "Something went wrong. Check /status and try again.".to_string(),
    }
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = UserId(from.id.0 as i64);
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        bot.send_message(msg.chat.id, "I only understand commands. See /help.")
            .await?;
        return Ok(());
    }

    let (cmd, _args) = parse_command(text);
    match cmd.as_str() {
        "start" => {
            bot.send_message(msg.chat.id, view::start_text()).await?;
        }
        "help" => {
            bot.send_message(msg.chat.id, view::help_text())
                .parse_mode(ParseMode::Html)
                .await?;
        }
        "auth" => {
            handle_auth(bot, &msg, user, state).await?;
        }
        "folders" => {
            send_folder_picker(bot, &msg, user, state).await?;
        }
        "status" => {
            match state.registry.forwarding_status(user).await {
                Ok(report) => {
                    bot.send_message(msg.chat.id, view::status_text(&report))
                        .parse_mode(ParseMode::Html)
                        .await?;
                }
                Err(err) => {
                    bot.send_message(msg.chat.id, describe_error(&err)).await?;
                }
            }
        }
        _ => {
            bot.send_message(msg.chat.id, "Unknown command. See /help.")
                .await?;
        }
    }
    Ok(())
}

async fn handle_auth(
    bot: Bot,
    msg: &Message,
    user: UserId,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let session = match state.registry.session(user).await {
        Ok(s) => s,
        Err(err) => {
            bot.send_message(msg.chat.id, describe_error(&err)).await?;
            return Ok(());
        }
    };
    if session.status().await == AuthStatus::Authorized {
        bot.send_message(msg.chat.id, "Already linked. Use /folders to pick folders.")
            .await?;
        return Ok(());
    }

    let challenge = match session.begin_interactive_auth().await {
        Ok(c) => c,
        Err(err) => {
            bot.send_message(msg.chat.id, describe_error(&err)).await?;
            return Ok(());
        }
    };

    if let Some(qr) = view::qr_unicode(&challenge.challenge_uri) {
        bot.send_message(msg.chat.id, format!("<pre>{qr}</pre>"))
            .parse_mode(ParseMode::Html)
            .await?;
    }
    bot.send_message(msg.chat.id, view::auth_text(&challenge.challenge_uri))
        .parse_mode(ParseMode::Html)
        .await?;

    // The wait for confirmation runs supervised in the background so the
    // handler returns immediately.
    let task_name = format!("auth:{user}");
    let chat_id = msg.chat.id;
    let notify_bot = bot.clone();
    let spawned = state
        .registry
        .background()
        .spawn(&task_name, Some(state.cfg.auth_flow_timeout), async move {
            match session.complete_interactive_auth().await {
                Ok(()) => {
                    let _ = notify_bot
                        .send_message(chat_id, "✅ Account linked. Use /folders to pick folders.")
                        .await;
                    Ok(())
                }
                Err(err) => {
                    let _ = notify_bot
                        .send_message(chat_id, format!("Login failed: {err}. Try /auth again."))
                        .await;
                    Err(err)
                }
            }
        })
        .await;
    if spawned.is_err() {
        bot.send_message(msg.chat.id, "A login is already in progress.")
            .await?;
    }
    Ok(())
}

async fn send_folder_picker(
    bot: Bot,
    msg: &Message,
    user: UserId,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    match folder_rows(&state, user, 0).await {
        Ok(rows) if rows.is_empty() => {
            bot.send_message(msg.chat.id, "Your account has no chat folders yet.")
                .await?;
        }
        Ok(rows) => {
            bot.send_message(msg.chat.id, "Select folders to forward:")
                .reply_markup(markup(rows))
                .await?;
        }
        Err(err) => {
            bot.send_message(msg.chat.id, describe_error(&err)).await?;
        }
    }
    Ok(())
}

async fn folder_rows(
    state: &AppState,
    user: UserId,
    page: usize,
) -> foldercast_core::Result<Vec<Vec<Button>>> {
    let session = state.registry.session(user).await?;
    let folders = session.list_folders().await?;
    let active = session.active_folder_ids().await;
    Ok(view::folder_keyboard(
        &folders,
        &active,
        page,
        state.cfg.folder_page_size,
    ))
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let user = UserId(q.from.id.0 as i64);
    let data = q.data.clone().unwrap_or_default();
    let Some(message) = q.message.as_ref() else {
        bot.answer_callback_query(cb_id).await?;
        return Ok(());
    };
    let chat_id = message.chat.id;
    let message_id = message.id;

    let (notice, page) = match view::parse_callback(&data) {
        Callback::Folder(folder_id) => (toggle_folder(&state, user, folder_id).await, 0),
        Callback::Page(page) => (None, page),
        Callback::Unknown => {
            bot.answer_callback_query(cb_id).await?;
            return Ok(());
        }
    };

    // Re-render the picker in place so the checkmarks stay current.
    match folder_rows(&state, user, page).await {
        Ok(rows) => {
            let _ = bot
                .edit_message_reply_markup(chat_id, message_id)
                .reply_markup(markup(rows))
                .await;
        }
        Err(err) => {
            warn!(user = %user, error = %err, "could not refresh folder picker");
        }
    }

    let mut answer = bot.answer_callback_query(cb_id);
    if let Some(text) = notice {
        answer = answer.text(text);
    }
    answer.await?;
    Ok(())
}

async fn toggle_folder(state: &AppState, user: UserId, folder_id: FolderId) -> Option<String> {
    let session = match state.registry.session(user).await {
        Ok(s) => s,
        Err(err) => return Some(describe_error(&err)),
    };
    if session.is_active(folder_id).await {
        match session.deactivate_folder(folder_id).await {
            Ok(()) => Some("Forwarding stopped".to_string()),
            Err(err) => Some(describe_error(&err)),
        }
    } else {
        match session.activate_folder(folder_id).await {
            Ok(binding) => Some(format!("Forwarding \"{}\"", binding.title)),
            Err(err) => Some(describe_error(&err)),
        }
    }
}
