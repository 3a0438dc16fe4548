use super::{settings, Command, HELP};
use crate::db::models::ProfileUpdate;
use crate::db::Database;
use crate::session::{SessionController, SessionView};
use crate::view::auth::{FormErrors, LoginForm, SignUpForm};
use crate::view::{
    char_counter, counter_warning, prepare_input, render_conversation_list, render_header,
    render_transcript, render_user_line, InputRejected,
};
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How long a command waits for a live snapshot before printing.
const SETTLE: Duration = Duration::from_millis(300);
const SIGNED_OUT: &str = "Please /login or /signup first.\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue(String),
    Quit,
}

/// Runs commands against one session and renders the result as text.
#[derive(Clone)]
pub struct Shell {
    controller: SessionController,
    db: Arc<Database>,
}

fn form_failure(errors: &FormErrors) -> String {
    let mut out = String::new();
    for message in errors.messages() {
        let _ = writeln!(out, "! {}", message);
    }
    out
}

/// Accepts a 1-based list position or a conversation id.
fn resolve_conversation(view: &SessionView, arg: &str) -> Option<String> {
    if let Ok(position) = arg.parse::<usize>() {
        if let Some(conversation) = position
            .checked_sub(1)
            .and_then(|i| view.conversations.get(i))
        {
            return Some(conversation.id.clone());
        }
    }
    view.conversations
        .iter()
        .find(|c| c.id == arg)
        .map(|c| c.id.clone())
}

impl Shell {
    pub fn new(controller: SessionController, db: Arc<Database>) -> Self {
        Self { controller, db }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Waits until `ready` holds for the current view or `SETTLE` passes.
    async fn settle(&self, ready: impl Fn(&SessionView) -> bool) -> SessionView {
        let mut changes = self.controller.changes();
        let waited = tokio::time::timeout(SETTLE, async {
            loop {
                if ready(&self.controller.view()) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        if waited.is_err() {
            debug!("view did not settle in time");
        }
        self.controller.view()
    }

    pub async fn execute(&self, command: Command) -> Flow {
        let output = match command {
            Command::Quit => return Flow::Quit,
            Command::Help => format!("{}\n", HELP),
            Command::SignUp {
                email,
                password,
                name,
            } => self.sign_up(email, password, name).await,
            Command::Login { email, password } => self.login(email, password).await,
            Command::ShowConfig => self.show_config(),
            Command::SetConfig { key, value } => {
                match settings::set_setting(&self.db, &key, &value) {
                    Ok(()) => format!("Saved {}. It takes effect on next start.\n", key),
                    Err(e) => format!("! {}\n", e),
                }
            }
            Command::UnsetConfig(key) => match settings::delete_setting(&self.db, &key) {
                Ok(()) => format!("Removed {}. It takes effect on next start.\n", key),
                Err(e) => format!("! {}\n", e),
            },
            other => {
                if self.controller.view().user.is_none() {
                    return Flow::Continue(SIGNED_OUT.to_string());
                }
                self.signed_in(other).await
            }
        };
        Flow::Continue(output)
    }

    async fn signed_in(&self, command: Command) -> String {
        match command {
            Command::Logout => {
                self.controller.sign_out().await;
                "Signed out.\n".to_string()
            }
            Command::New => {
                self.controller.start_new_conversation();
                let view = self.controller.view();
                format!("{}{}", render_header(&view), render_transcript(&view))
            }
            Command::List => render_conversation_list(&self.controller.view(), Utc::now()),
            Command::Open(arg) => {
                let Some(id) = resolve_conversation(&self.controller.view(), &arg) else {
                    return format!("! No conversation matches '{}'. Try /list.\n", arg);
                };
                self.controller.open_conversation(&id);
                let view = self.settle(|v| !v.transcript.is_empty()).await;
                format!("{}{}", render_header(&view), render_transcript(&view))
            }
            Command::Delete(arg) => {
                let Some(id) = resolve_conversation(&self.controller.view(), &arg) else {
                    return format!("! No conversation matches '{}'. Try /list.\n", arg);
                };
                match self.controller.delete_conversation(&id).await {
                    Ok(()) => {
                        let view = self
                            .settle(|v| v.conversations.iter().all(|c| c.id != id))
                            .await;
                        format!(
                            "Conversation deleted.\n{}",
                            render_conversation_list(&view, Utc::now())
                        )
                    }
                    Err(e) => format!("! Failed to delete conversation: {}\n", e),
                }
            }
            Command::Rename(title) => {
                if self.controller.view().active_conversation_id.is_none() {
                    return "! Open a conversation first.\n".to_string();
                }
                match self.controller.rename_active_conversation(&title).await {
                    Ok(()) => format!("Renamed to '{}'.\n", title),
                    Err(e) => format!("! Failed to rename conversation: {}\n", e),
                }
            }
            Command::Stats => {
                self.controller.refresh_stats().await;
                render_user_line(&self.controller.view())
            }
            Command::Profile(name) => {
                let update = ProfileUpdate {
                    name: Some(name),
                    avatar: None,
                };
                match self.controller.update_profile(update).await {
                    Ok(()) => render_user_line(&self.controller.view()),
                    Err(e) => format!("! Failed to update profile: {}\n", e),
                }
            }
            Command::Send(raw) => {
                let text = match prepare_input(&raw, self.controller.view().pending) {
                    Ok(text) => text,
                    Err(rejected @ InputRejected::TooLong { .. }) => {
                        return format!("! {} [{}]\n", rejected, char_counter(raw.trim()));
                    }
                    Err(rejected) => return format!("! {}\n", rejected),
                };
                let warning = counter_warning(&text)
                    .map(|counter| format!("[{}]\n", counter))
                    .unwrap_or_default();
                self.controller.send_message(&text).await;
                let view = self.controller.view();
                format!(
                    "{}{}{}",
                    warning,
                    render_header(&view),
                    render_transcript(&view)
                )
            }
            // Handled before the sign-in check.
            Command::Quit
            | Command::Help
            | Command::SignUp { .. }
            | Command::Login { .. }
            | Command::ShowConfig
            | Command::SetConfig { .. }
            | Command::UnsetConfig(_) => String::new(),
        }
    }

    async fn sign_up(&self, email: String, password: String, name: String) -> String {
        let form = SignUpForm {
            name,
            email,
            confirm_password: password.clone(),
            password,
        };
        let errors = form.validate();
        if !errors.is_empty() {
            return form_failure(&errors);
        }
        match self
            .controller
            .sign_up(&form.email, &form.password, form.name.trim())
            .await
        {
            Ok(user) => format!("Welcome, {}!\n{}", user.name, self.signed_in_banner().await),
            Err(e) => form_failure(&FormErrors::from_auth_error(&e)),
        }
    }

    async fn login(&self, email: String, password: String) -> String {
        let form = LoginForm { email, password };
        let errors = form.validate();
        if !errors.is_empty() {
            return form_failure(&errors);
        }
        match self.controller.sign_in(&form.email, &form.password).await {
            Ok(user) => format!(
                "Welcome back, {}!\n{}",
                user.name,
                self.signed_in_banner().await
            ),
            Err(e) => form_failure(&FormErrors::from_auth_error(&e)),
        }
    }

    async fn signed_in_banner(&self) -> String {
        let view = self.settle(|v| !v.conversations.is_empty()).await;
        format!(
            "{}{}",
            render_user_line(&view),
            render_conversation_list(&view, Utc::now())
        )
    }

    fn show_config(&self) -> String {
        match settings::get_settings(&self.db) {
            Ok(stored) if stored.is_empty() => "No settings stored.\n".to_string(),
            Ok(stored) => {
                let mut out = String::new();
                for (key, value) in stored {
                    let _ = writeln!(out, "{} = {}", key, value);
                }
                out
            }
            Err(e) => format!("! {}\n", e),
        }
    }
}
