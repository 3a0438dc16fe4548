use ai_chatbot_lib::commands::{Command, Flow, Shell};
use ai_chatbot_lib::db::models::{ChatStats, Conversation, Message, ProfileUpdate, Sender, User};
use ai_chatbot_lib::error::{AuthError, PersistenceError};
use ai_chatbot_lib::llm::Inference;
use ai_chatbot_lib::remote::{Callback, LocalRemote, RemoteService, Subscription};
use ai_chatbot_lib::session::{
    conversation_title, draft_title, EntryStatus, SessionController, SessionView,
    SEND_FAILED_REPLY,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

struct Echo;

#[async_trait]
impl Inference for Echo {
    async fn complete(&self, prompt: &str) -> String {
        format!("echo: {}", prompt)
    }
}

/// Replies only once released, announcing when a prompt arrives.
#[derive(Default)]
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Inference for Gated {
    async fn complete(&self, prompt: &str) -> String {
        self.started.notify_one();
        self.release.notified().await;
        format!("late: {}", prompt)
    }
}

/// Local backend that counts data calls and transcript cancellations and
/// can be told to fail.
struct Instrumented {
    inner: LocalRemote,
    data_calls: AtomicUsize,
    transcript_cancels: Arc<AtomicUsize>,
    fail_appends: AtomicBool,
    fail_sign_out: AtomicBool,
    fail_subscribe: AtomicBool,
    created_titles: Mutex<Vec<String>>,
}

impl Instrumented {
    fn new() -> Self {
        Self {
            inner: LocalRemote::in_memory().unwrap(),
            data_calls: AtomicUsize::new(0),
            transcript_cancels: Arc::new(AtomicUsize::new(0)),
            fail_appends: AtomicBool::new(false),
            fail_sign_out: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            created_titles: Mutex::new(Vec::new()),
        }
    }

    fn count(&self) {
        self.data_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.data_calls.load(Ordering::SeqCst)
    }

    fn check_subscribe(&self) -> Result<(), PersistenceError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("feeds offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteService for Instrumented {
    async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<User, AuthError> {
        self.inner.sign_up(email, password, name).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        self.inner.sign_in(email, password).await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(AuthError::Network("offline".into()));
        }
        self.inner.sign_out().await
    }

    fn current_user(&self) -> Option<User> {
        self.inner.current_user()
    }

    fn on_auth_change(&self, callback: Callback<Option<User>>) -> Subscription {
        self.inner.on_auth_change(callback)
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<User>, PersistenceError> {
        self.inner.get_profile(user_id).await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), PersistenceError> {
        self.inner.update_profile(user_id, update).await
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        first_message: &str,
    ) -> Result<String, PersistenceError> {
        self.count();
        self.created_titles.lock().unwrap().push(title.to_string());
        self.inner
            .create_conversation(user_id, title, first_message)
            .await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, PersistenceError> {
        self.count();
        self.inner.list_conversations(user_id).await
    }

    fn subscribe_conversations(
        &self,
        user_id: &str,
        callback: Callback<Vec<Conversation>>,
    ) -> Result<Subscription, PersistenceError> {
        self.count();
        self.check_subscribe()?;
        self.inner.subscribe_conversations(user_id, callback)
    }

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), PersistenceError> {
        self.count();
        self.inner.rename_conversation(conversation_id, title).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), PersistenceError> {
        self.count();
        self.inner.delete_conversation(conversation_id).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, PersistenceError> {
        self.count();
        self.inner.list_messages(conversation_id).await
    }

    fn subscribe_messages(
        &self,
        conversation_id: &str,
        callback: Callback<Vec<Message>>,
    ) -> Result<Subscription, PersistenceError> {
        self.count();
        self.check_subscribe()?;
        let handle = self.inner.subscribe_messages(conversation_id, callback)?;
        let cancels = Arc::clone(&self.transcript_cancels);
        Ok(Subscription::new(move || {
            cancels.fetch_add(1, Ordering::SeqCst);
            handle.cancel();
        }))
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        text: &str,
        sender: Sender,
    ) -> Result<String, PersistenceError> {
        self.count();
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("store offline".into()));
        }
        self.inner
            .append_message(conversation_id, user_id, text, sender)
            .await
    }

    async fn get_stats(&self, user_id: &str) -> Result<ChatStats, PersistenceError> {
        self.count();
        self.inner.get_stats(user_id).await
    }
}

async fn wait_for(
    controller: &SessionController,
    ready: impl Fn(&SessionView) -> bool,
) -> SessionView {
    let mut changes = controller.changes();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let view = controller.view();
            if ready(&view) {
                return view;
            }
            changes.changed().await.expect("controller dropped");
        }
    })
    .await
    .expect("timed out waiting for session state")
}

async fn signed_in() -> (Arc<Instrumented>, SessionController, User) {
    signed_in_with(Arc::new(Echo)).await
}

async fn signed_in_with(
    inference: Arc<dyn Inference>,
) -> (Arc<Instrumented>, SessionController, User) {
    let remote = Arc::new(Instrumented::new());
    let controller = SessionController::new(remote.clone(), inference);
    let user = controller
        .sign_up("ada@example.com", "secret-pass", "Ada")
        .await
        .unwrap();
    wait_for(&controller, |v| v.listening_conversations).await;
    (remote, controller, user)
}

#[tokio::test]
async fn first_message_creates_a_titled_conversation() {
    let (remote, controller, user) = signed_in().await;

    controller.send_message("Tell me a joke").await;

    let view = controller.view();
    assert!(!view.pending);
    let active = view.active_conversation_id.clone().expect("no active conversation");

    let conversations = remote.inner.list_conversations(&user.id).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, active);
    assert_eq!(conversations[0].title, "Tell me a joke");
    assert_eq!(conversations[0].message_count, 2);

    let messages = remote.inner.list_messages(&active).await.unwrap();
    let turns: Vec<_> = messages.iter().map(|m| (m.sender, m.text.as_str())).collect();
    assert_eq!(
        turns,
        vec![
            (Sender::User, "Tell me a joke"),
            (Sender::Assistant, "echo: Tell me a joke"),
        ]
    );

    let view = wait_for(&controller, |v| {
        v.transcript.len() == 2
            && v.transcript.iter().all(|e| e.status == EntryStatus::Confirmed)
    })
    .await;
    assert_eq!(view.transcript[1].text, "echo: Tell me a joke");

    let view = wait_for(&controller, |v| {
        v.conversations.len() == 1 && v.conversations[0].message_count == 2
    })
    .await;
    assert_eq!(view.active_conversation().unwrap().title, "Tell me a joke");
}

#[tokio::test]
async fn follow_up_messages_stay_in_the_open_conversation() {
    let (remote, controller, user) = signed_in().await;
    controller.send_message("first").await;
    let active = controller.view().active_conversation_id.unwrap();

    controller.send_message("second").await;
    assert_eq!(controller.view().active_conversation_id.as_deref(), Some(active.as_str()));

    let conversations = remote.inner.list_conversations(&user.id).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].message_count, 4);
    assert_eq!(conversations[0].title, "first");
}

#[tokio::test]
async fn opening_a_conversation_loads_its_ordered_messages() {
    let (remote, controller, user) = signed_in().await;
    let id = remote
        .inner
        .create_conversation(&user.id, "history", "one")
        .await
        .unwrap();
    for (text, sender) in [("two", Sender::Assistant), ("three", Sender::User)] {
        remote
            .inner
            .append_message(&id, &user.id, text, sender)
            .await
            .unwrap();
    }

    controller.open_conversation(&id);
    let view = wait_for(&controller, |v| v.transcript.len() == 3).await;

    assert_eq!(view.active_conversation_id.as_deref(), Some(id.as_str()));
    let texts: Vec<_> = view.transcript.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    assert!(view
        .transcript
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn deleting_the_active_conversation_clears_it() {
    let (_remote, controller, _user) = signed_in().await;
    controller.send_message("Tell me a joke").await;
    let id = controller.view().active_conversation_id.unwrap();
    wait_for(&controller, |v| v.conversations.len() == 1).await;

    controller.delete_conversation(&id).await.unwrap();

    let view = controller.view();
    assert!(view.active_conversation_id.is_none());
    assert!(view.transcript.is_empty());
    wait_for(&controller, |v| v.conversations.is_empty()).await;
}

#[tokio::test]
async fn starting_a_new_conversation_is_local_only() {
    let (remote, controller, user) = signed_in().await;
    let id = remote
        .inner
        .create_conversation(&user.id, "kept", "hello")
        .await
        .unwrap();
    controller.open_conversation(&id);
    wait_for(&controller, |v| {
        v.transcript.len() == 1 && v.conversations.len() == 1
    })
    .await;

    let before = remote.calls();
    controller.start_new_conversation();

    let view = controller.view();
    assert_eq!(remote.calls(), before);
    assert!(view.active_conversation_id.is_none());
    assert!(view.transcript.is_empty());
    assert_eq!(view.conversations.len(), 1);
    assert_eq!(view.conversations[0].id, id);
}

#[tokio::test]
async fn sign_out_cancels_the_transcript_feed_once() {
    let (remote, controller, user) = signed_in().await;
    let id = remote
        .inner
        .create_conversation(&user.id, "t", "hello")
        .await
        .unwrap();
    controller.open_conversation(&id);
    wait_for(&controller, |v| v.listening_transcript && !v.transcript.is_empty()).await;

    controller.sign_out().await;

    assert_eq!(remote.transcript_cancels.load(Ordering::SeqCst), 1);
    let view = controller.view();
    assert!(view.user.is_none());
    assert!(view.transcript.is_empty());
    assert!(view.conversations.is_empty());
    assert!(view.active_conversation_id.is_none());
    assert!(!view.listening_transcript);
    assert!(!view.listening_conversations);

    remote
        .inner
        .append_message(&id, &user.id, "after sign-out", Sender::User)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.view().transcript.is_empty());
}

#[tokio::test]
async fn stats_follow_message_counts() {
    let (remote, controller, user) = signed_in().await;
    let empty = controller.view().stats.expect("stats not loaded");
    assert_eq!(empty.total_conversations, 0);
    assert_eq!(empty.average_messages_per_conversation, 0.0);

    let a = remote.inner.create_conversation(&user.id, "a", "1").await.unwrap();
    remote
        .inner
        .append_message(&a, &user.id, "2", Sender::Assistant)
        .await
        .unwrap();
    let b = remote.inner.create_conversation(&user.id, "b", "1").await.unwrap();
    for text in ["2", "3", "4", "5"] {
        remote
            .inner
            .append_message(&b, &user.id, text, Sender::User)
            .await
            .unwrap();
    }

    controller.refresh_stats().await;
    let stats = controller.view().stats.unwrap();
    assert_eq!(stats.total_conversations, 2);
    assert_eq!(stats.total_messages, 7);
    assert_eq!(stats.average_messages_per_conversation, 3.5);
}

#[tokio::test]
async fn failed_append_shows_an_error_bubble() {
    let (remote, controller, user) = signed_in().await;
    let id = remote
        .inner
        .create_conversation(&user.id, "t", "hello")
        .await
        .unwrap();
    controller.open_conversation(&id);
    wait_for(&controller, |v| v.listening_transcript && v.transcript.len() == 1).await;

    remote.fail_appends.store(true, Ordering::SeqCst);
    controller.send_message("are you there?").await;

    let view = controller.view();
    assert!(!view.pending);
    let last = view.transcript.last().unwrap();
    assert!(last.is_error());
    assert_eq!(last.sender, Sender::Assistant);
    assert_eq!(last.text, SEND_FAILED_REPLY);
    assert_eq!(remote.inner.list_messages(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sending_without_a_user_or_text_does_nothing() {
    let remote = Arc::new(Instrumented::new());
    let controller = SessionController::new(remote.clone(), Arc::new(Echo));

    controller.send_message("hello").await;
    assert_eq!(remote.calls(), 0);
    assert!(controller.view().transcript.is_empty());

    let (remote, controller, _user) = signed_in().await;
    let before = remote.calls();
    controller.send_message("   ").await;
    assert_eq!(remote.calls(), before);
    assert!(controller.view().transcript.is_empty());
    assert!(!controller.view().pending);
}

#[tokio::test]
async fn remote_sign_out_failure_still_clears_the_session() {
    let (remote, controller, _user) = signed_in().await;
    remote.fail_sign_out.store(true, Ordering::SeqCst);

    controller.sign_out().await;

    let view = controller.view();
    assert!(view.user.is_none());
    assert!(view.stats.is_none());
}

#[tokio::test]
async fn external_sign_out_is_followed() {
    let (remote, controller, _user) = signed_in().await;
    controller.watch_auth();

    remote.inner.sign_out().await.unwrap();

    let view = wait_for(&controller, |v| v.user.is_none()).await;
    assert!(view.conversations.is_empty());
}

#[tokio::test]
async fn profile_updates_reach_the_view() {
    let (remote, controller, user) = signed_in().await;
    controller
        .update_profile(ProfileUpdate {
            name: Some("Countess".into()),
            avatar: None,
        })
        .await
        .unwrap();

    assert_eq!(controller.view().user.unwrap().name, "Countess");
    let stored = remote.inner.get_profile(&user.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "Countess");
}

#[tokio::test]
async fn long_first_message_is_drafted_then_titled_with_ellipsis() {
    let (remote, controller, user) = signed_in().await;
    let text = "Please summarise the history of the printing press in Europe";
    assert!(text.chars().count() > 50);

    controller.send_message(text).await;

    assert_eq!(*remote.created_titles.lock().unwrap(), vec![draft_title(text)]);
    let stored = remote.inner.list_conversations(&user.id).await.unwrap();
    assert_eq!(stored[0].title, conversation_title(text));
    assert!(stored[0].title.ends_with("..."));
    assert_eq!(stored[0].title.chars().count(), 53);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reply_for_a_conversation_left_mid_send_stays_out_of_the_next() {
    let gated = Arc::new(Gated::default());
    let (started, release) = (Arc::clone(&gated.started), Arc::clone(&gated.release));
    let (remote, controller, user) = signed_in_with(gated).await;
    let a = remote.inner.create_conversation(&user.id, "a", "a1").await.unwrap();
    let b = remote.inner.create_conversation(&user.id, "b", "b1").await.unwrap();

    controller.open_conversation(&a);
    wait_for(&controller, |v| v.listening_transcript && v.transcript.len() == 1).await;

    let sending = tokio::spawn({
        let controller = controller.clone();
        async move { controller.send_message("to a").await }
    });
    started.notified().await;

    controller.open_conversation(&b);
    wait_for(&controller, |v| v.transcript.len() == 1 && v.transcript[0].text == "b1").await;
    release.notify_one();
    sending.await.unwrap();

    let view = controller.view();
    assert_eq!(view.active_conversation_id.as_deref(), Some(b.as_str()));
    let texts: Vec<_> = view.transcript.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["b1"]);
    assert!(!view.pending);

    let persisted: Vec<_> = remote
        .inner
        .list_messages(&a)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(persisted, vec!["a1", "to a", "late: to a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reply_from_a_previous_session_is_dropped() {
    let gated = Arc::new(Gated::default());
    let (started, release) = (Arc::clone(&gated.started), Arc::clone(&gated.release));
    let (remote, controller, user) = signed_in_with(gated).await;
    let a = remote.inner.create_conversation(&user.id, "a", "a1").await.unwrap();
    controller.open_conversation(&a);
    wait_for(&controller, |v| v.listening_transcript && v.transcript.len() == 1).await;

    let sending = tokio::spawn({
        let controller = controller.clone();
        async move { controller.send_message("still there?").await }
    });
    started.notified().await;

    controller.sign_out().await;
    controller
        .sign_in("ada@example.com", "secret-pass")
        .await
        .unwrap();
    release.notify_one();
    sending.await.unwrap();

    let view = controller.view();
    assert!(view.user.is_some());
    assert!(view.active_conversation_id.is_none());
    assert!(view.transcript.is_empty());
    assert!(!view.pending);
}

#[tokio::test]
async fn failed_subscriptions_are_tolerated() {
    let remote = Arc::new(Instrumented::new());
    remote.fail_subscribe.store(true, Ordering::SeqCst);
    let controller = SessionController::new(remote.clone(), Arc::new(Echo));

    let user = controller
        .sign_up("ada@example.com", "secret-pass", "Ada")
        .await
        .unwrap();
    let view = controller.view();
    assert_eq!(view.user.as_ref(), Some(&user));
    assert!(!view.listening_conversations);
    assert!(view.stats.is_some());

    controller.send_message("hello").await;
    let view = controller.view();
    assert!(!view.pending);
    assert!(!view.listening_transcript);
    assert!(view.active_conversation_id.is_some());
    assert!(view.transcript.iter().all(|e| !e.is_error()));
    assert_eq!(view.transcript.last().unwrap().text, "echo: hello");
    assert_eq!(remote.inner.list_conversations(&user.id).await.unwrap().len(), 1);

    let other = remote.inner.create_conversation(&user.id, "o", "x").await.unwrap();
    controller.open_conversation(&other);
    let view = controller.view();
    assert_eq!(view.active_conversation_id.as_deref(), Some(other.as_str()));
    assert!(!view.listening_transcript);
}

#[tokio::test]
async fn shell_walks_through_a_chat() {
    let remote = Arc::new(LocalRemote::in_memory().unwrap());
    let db = Arc::clone(remote.database());
    let controller = SessionController::new(remote, Arc::new(Echo));
    let shell = Shell::new(controller.clone(), db);

    let run = |line: &str| {
        let shell = shell.clone();
        let command: Command = line.parse().unwrap();
        async move {
            match shell.execute(command).await {
                Flow::Continue(output) => output,
                Flow::Quit => "<quit>".to_string(),
            }
        }
    };

    assert!(run("/list").await.starts_with("Please /login"));
    assert!(run("/login ada@example.com short").await.contains("at least 6 characters"));

    let welcome = run("/signup ada@example.com secret-pass Ada").await;
    assert!(welcome.starts_with("Welcome, Ada!"));

    let reply = run("Tell me a joke").await;
    assert!(reply.contains("echo: Tell me a joke"));

    wait_for(&controller, |v| {
        v.conversations.len() == 1 && v.conversations[0].title == "Tell me a joke"
    })
    .await;

    let too_long = run("x".repeat(1001).as_str()).await;
    assert!(too_long.starts_with("! message is 1001 characters"));
    assert!(too_long.contains("[1001/1000 (too long)]"));
    let nearly_full = run("y".repeat(900).as_str()).await;
    assert!(nearly_full.starts_with("[900/1000 (almost full)]\n"));

    assert!(run("/list").await.contains("1. Tell me a joke"));

    run("/new").await;
    let opened = run("/open 1").await;
    assert!(opened.starts_with("== Tell me a joke =="));

    assert!(run("/config set theme dark").await.starts_with("! "));
    assert!(run("/config set gemini_model gemini-1.5-pro")
        .await
        .contains("next start"));
    assert_eq!(run("/config").await, "gemini_model = gemini-1.5-pro\n");

    assert_eq!(run("/logout").await, "Signed out.\n");
    assert!(run("/login ada@example.com wrong-pass").await.contains("! "));
    assert_eq!(run("/quit").await, "<quit>");
}
