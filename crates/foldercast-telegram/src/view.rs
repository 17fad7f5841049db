//! Pure rendering and parsing for the bot surface. Everything here is plain
//! data in, strings out, so it is testable without a Telegram connection.

use foldercast_core::{
    domain::FolderId,
    remote::FolderInfo,
    session::{AuthStatus, SessionReport},
};

/// A decoded callback button press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callback {
    Folder(FolderId),
    Page(usize),
    Unknown,
}

pub fn folder_callback_data(folder: FolderId) -> String {
    format!("folder:{}", folder.0)
}

pub fn page_callback_data(page: usize) -> String {
    format!("page:{page}")
}

pub fn parse_callback(data: &str) -> Callback {
    match data.split_once(':') {
        Some(("folder", id)) => id
            .parse()
            .map(|id| Callback::Folder(FolderId(id)))
            .unwrap_or(Callback::Unknown),
        Some(("page", n)) => n.parse().map(Callback::Page).unwrap_or(Callback::Unknown),
        _ => Callback::Unknown,
    }
}

/// One keyboard button: label plus callback data.
pub type Button = (String, String);

/// Builds the folder picker for one page. Active folders are checked; a
/// navigation row appears only when there is more than one page.
pub fn folder_keyboard(
    folders: &[FolderInfo],
    active: &[FolderId],
    page: usize,
    page_size: usize,
) -> Vec<Vec<Button>> {
    let page_size = page_size.max(1);
    let pages = folders.len().div_ceil(page_size).max(1);
    let page = page.min(pages - 1);

    let mut rows: Vec<Vec<Button>> = folders
        .iter()
        .skip(page * page_size)
        .take(page_size)
        .map(|folder| {
            let mark = if active.contains(&folder.id) {
                "[x]"
            } else {
                "[ ]"
            };
            vec![(
                format!("{mark} {}", folder.title),
                folder_callback_data(folder.id),
            )]
        })
        .collect();

    if pages > 1 {
        let mut nav = Vec::new();
        if page > 0 {
            nav.push(("« Prev".to_string(), page_callback_data(page - 1)));
        }
        nav.push((format!("{}/{pages}", page + 1), page_callback_data(page)));
        if page + 1 < pages {
            nav.push(("Next »".to_string(), page_callback_data(page + 1)));
        }
        rows.push(nav);
    }
    rows
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn start_text() -> String {
    "👋 This bot mirrors chat folders from your account into dedicated channels.\n\n\
     Use /auth to link your account, then /folders to pick what to forward.\n\
     /help shows all commands."
        .to_string()
}

pub fn help_text() -> String {
    "<b>Commands</b>\n\
     /auth — link your account (QR login)\n\
     /folders — choose folders to forward\n\
     /status — connection and queue status\n\
     /help — this message"
        .to_string()
}

fn status_label(status: AuthStatus) -> &'static str {
    match status {
        AuthStatus::Unauthenticated => "🔑 not linked — use /auth",
        AuthStatus::Authenticating => "⏳ login in progress",
        AuthStatus::Authorized => "✅ connected",
        AuthStatus::Degraded => "⚠️ degraded — re-link with /auth",
        AuthStatus::ShutDown => "⏹ shut down",
    }
}

pub fn status_text(report: &SessionReport) -> String {
    let mut out = format!("<b>Status</b>: {}\n", status_label(report.status));
    if report.folders.is_empty() {
        out.push_str("\nNo folders are being forwarded. Use /folders to pick some.");
        return out;
    }
    out.push_str("\n<b>Forwarding</b>\n");
    for folder in &report.folders {
        out.push_str(&format!(
            "• {} → channel <code>{}</code> (queued: {})\n",
            escape_html(&folder.title),
            folder.channel_id,
            folder.queue_depth
        ));
    }
    out
}

pub fn auth_text(challenge_uri: &str) -> String {
    format!(
        "Scan this with a logged-in device, or open the link:\n<code>{}</code>",
        escape_html(challenge_uri)
    )
}

/// Renders the login challenge as a unicode QR block for chat display.
pub fn qr_unicode(uri: &str) -> Option<String> {
    let code = qrcode::QrCode::new(uri.as_bytes()).ok()?;
    Some(
        code.render::<qrcode::render::unicode::Dense1x2>()
            .quiet_zone(false)
            .build(),
    )
}
