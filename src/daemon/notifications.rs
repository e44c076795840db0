//! Owner notifications: chat (webhook via curl) and email (sendmail).
//!
//! The dispatcher renders one alert per decision and fans it out. Chat alerts
//! are queued to a single `cw-chat` worker that sends them in order behind a
//! process-wide [`ChatThrottle`], so a throttled chat send never delays email
//! or persistence. A failure in one channel never affects the other.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WardenError};
use crate::model::fingerprint::Fingerprint;

// ──────────────────── message ────────────────────

/// One rendered alert. Derived per decision, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    pub namespace: String,
    pub cluster: String,
    /// e.g. `Pod Name`.
    pub entity_type: String,
    pub entity_source: String,
    /// Human label of the violation kind.
    pub violation_type: String,
    pub violation_source: String,
    /// Prior notification count plus one.
    pub warning_count: usize,
    pub last_warning: bool,
}

impl NotificationMessage {
    #[must_use]
    pub fn new(fingerprint: &Fingerprint, prior_notifications: usize, last_warning: bool) -> Self {
        Self {
            namespace: fingerprint.namespace.clone(),
            cluster: fingerprint.cluster.clone(),
            entity_type: format!("{} Name", fingerprint.entity_kind),
            entity_source: fingerprint.entity_name.clone(),
            violation_type: fingerprint.violation_kind.label().to_string(),
            violation_source: fingerprint.violation_source.clone(),
            warning_count: prior_notifications + 1,
            last_warning,
        }
    }

    #[must_use]
    pub const fn subject(&self) -> &'static str {
        if self.last_warning {
            "LAST WARNING: Kubernetes Violation!"
        } else {
            "Kubernetes Violation!"
        }
    }

    /// Chat color; severity depends only on `last_warning`.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        if self.last_warning { "red" } else { "yellow" }
    }

    #[must_use]
    pub fn render_html(&self) -> String {
        let icon = if self.last_warning { "&#x1F6D1;" } else { "&#x26A0;&#xFE0F;" };
        let mut html = format!(
            "{icon} Violation in namespace <b>{ns}</b> in <b>{cluster}</b>:\n<p>\n<ul>\n\
             <li>{etype}: {esource}</li>\n\
             <li>Violation: {vtype}</li>\n\
             <li>Source: {vsource}</li>\n\
             <li>Warning Count: {count}</li>\n</ul>\n",
            ns = escape_html(&self.namespace),
            cluster = escape_html(&self.cluster),
            etype = escape_html(&self.entity_type),
            esource = escape_html(&self.entity_source),
            vtype = escape_html(&self.violation_type),
            vsource = escape_html(&self.violation_source),
            count = self.warning_count,
        );
        if self.last_warning {
            html.push_str("<b>This is the last warning before taking action!</b>\n");
        }
        html.push_str("</p>\n");
        html
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `raw` as the inside of a JSON string literal.
fn escape_json(raw: &str) -> String {
    let quoted = serde_json::Value::from(raw).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(quoted.as_str())
        .to_string()
}

// ──────────────────── configuration ────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch for all channels.
    pub enabled: bool,
    pub chat: ChatConfig,
    pub email: EmailConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chat: ChatConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    pub enabled: bool,
    pub webhook_url: String,
    /// Process-wide minimum spacing between chat sends.
    pub min_interval_ms: u64,
    /// Precede each alert with a mention of the namespace owners.
    pub tag_namespace_owner: bool,
    pub owner_annotation: String,
    /// JSON body with `${MESSAGE}`, `${COLOR}` and `${FORMAT}` placeholders.
    pub template: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            min_interval_ms: 1_000,
            tag_namespace_owner: false,
            owner_annotation: "team/chat-ids".to_string(),
            template: r#"{"color":"${COLOR}","message":"${MESSAGE}","message_format":"${FORMAT}","notify":true}"#
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub sendmail_command: PathBuf,
    pub from: String,
    /// Mail the addresses in the namespace owner annotation.
    pub send_to_namespace_owner: bool,
    pub owner_annotation: String,
    /// Used when owners are not mailed or the annotation is missing.
    pub fallback_recipients: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sendmail_command: PathBuf::from("sendmail"),
            from: String::new(),
            send_to_namespace_owner: true,
            owner_annotation: "team/email-ids".to_string(),
            fallback_recipients: Vec::new(),
        }
    }
}

// ──────────────────── collaborator seams ────────────────────

/// What the engine needs from a notification fan-out.
pub trait Notifier: Send {
    /// Deliver `message` to every enabled channel. Returns the failures of
    /// channels that completed synchronously; asynchronous channels log their
    /// own failures.
    fn dispatch(&self, message: &NotificationMessage) -> Vec<WardenError>;

    /// Wait for queued asynchronous deliveries. Called once, at shutdown.
    fn drain(&self) {}
}

/// Source of namespace annotations (owner chat handles and email addresses).
pub trait NamespaceDirectory: Send + Sync {
    fn annotations(&self, namespace: &str) -> Result<BTreeMap<String, String>>;
}

/// Outbound chat transport.
pub trait ChatTransport: Send + Sync {
    fn post(&self, body: &str) -> Result<()>;
}

/// Outbound mail transport.
pub trait MailTransport: Send + Sync {
    fn send(&self, email: &Email) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

impl Email {
    /// RFC 5322 text suitable for `sendmail -t`.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=utf-8\r\n\r\n{}",
            self.from,
            self.to.join(", "),
            self.subject,
            self.html_body
        )
    }
}

// ──────────────────── chat throttle ────────────────────

/// Process-wide spacing between chat sends. Acquire, sleep out the rest of
/// the interval and stamp the new send time all happen under one lock, so
/// concurrent senders queue up instead of being dropped.
#[derive(Debug)]
pub struct ChatThrottle {
    min_interval: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl ChatThrottle {
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_send: Mutex::new(None),
        }
    }

    /// Block until this caller may send. Returns how long it slept.
    pub fn wait_turn(&self) -> Duration {
        let mut last = self.last_send.lock();
        let mut slept = Duration::ZERO;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                slept = self.min_interval - elapsed;
                thread::sleep(slept);
            }
        }
        *last = Some(Instant::now());
        slept
    }
}

// ──────────────────── channels ────────────────────

/// A notification channel.
trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(
        &self,
        message: &NotificationMessage,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;
}

// ──── Chat ────

struct ChatChannel {
    transport: Box<dyn ChatTransport>,
    template: String,
    tag_namespace_owner: bool,
    owner_annotation: String,
}

impl ChatChannel {
    fn render_body(&self, message: &str, color: &str, format: &str) -> String {
        self.template
            .replace("${MESSAGE}", &escape_json(message))
            .replace("${COLOR}", &escape_json(color))
            .replace("${FORMAT}", &escape_json(format))
    }
}

impl Channel for ChatChannel {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn send(
        &self,
        message: &NotificationMessage,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let color = message.color();
        if self.tag_namespace_owner
            && let Some(handles) = annotations.get(&self.owner_annotation)
        {
            let tags: Vec<String> = handles
                .split(',')
                .map(|h| h.trim().trim_start_matches('@'))
                .filter(|h| !h.is_empty())
                .map(|h| format!("@{h}"))
                .collect();
            if !tags.is_empty() {
                self.transport
                    .post(&self.render_body(&tags.join(" "), color, "text"))?;
            }
        }
        self.transport
            .post(&self.render_body(&message.render_html(), color, "html"))
    }
}

// ──── Email ────

struct EmailChannel {
    transport: Box<dyn MailTransport>,
    from: String,
    send_to_namespace_owner: bool,
    owner_annotation: String,
    fallback_recipients: Vec<String>,
}

impl EmailChannel {
    fn recipients(&self, annotations: &BTreeMap<String, String>) -> Vec<String> {
        let owners = self
            .send_to_namespace_owner
            .then(|| annotations.get(&self.owner_annotation))
            .flatten()
            .map(|raw| split_list(raw))
            .filter(|list| !list.is_empty());
        owners.unwrap_or_else(|| self.fallback_recipients.clone())
    }
}

impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn send(
        &self,
        message: &NotificationMessage,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let to = self.recipients(annotations);
        if to.is_empty() {
            tracing::debug!(namespace = %message.namespace, "no email recipients, skipping");
            return Ok(());
        }
        self.transport.send(&Email {
            from: self.from.clone(),
            to,
            subject: message.subject().to_string(),
            html_body: message.render_html(),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

// ──────────────────── chat worker ────────────────────

struct ChatJob {
    message: NotificationMessage,
    annotations: BTreeMap<String, String>,
}

/// The `cw-chat` thread and its bounded queue. Alerts go out in the order
/// they were queued, each one spaced by the throttle. A full queue drops the
/// alert and counts it.
struct ChatWorker {
    tx: Mutex<Option<Sender<ChatJob>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl ChatWorker {
    fn spawn(channel: ChatChannel, throttle: Arc<ChatThrottle>, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<ChatJob>(capacity.max(1));
        let join = thread::Builder::new()
            .name("cw-chat".to_string())
            .spawn(move || {
                for job in rx {
                    throttle.wait_turn();
                    if let Err(error) = channel.send(&job.message, &job.annotations) {
                        tracing::warn!(
                            channel = "chat",
                            namespace = %job.message.namespace,
                            entity = %job.message.entity_source,
                            %error,
                            "notification failed"
                        );
                    }
                }
            })
            .map_err(|e| WardenError::NotificationChannel {
                channel: "chat",
                details: format!("failed to spawn chat worker: {e}"),
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Never blocks.
    fn enqueue(&self, job: ChatJob) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(stopped());
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    namespace = %job.message.namespace,
                    dropped,
                    "chat queue full, alert dropped"
                );
                Err(WardenError::NotificationChannel {
                    channel: "chat",
                    details: "chat queue full, alert dropped".to_string(),
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(stopped()),
        }
    }

    /// Close the queue and wait for everything already queued to go out.
    fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(join) = self.join.lock().take()
            && join.join().is_err()
        {
            tracing::error!("chat worker panicked");
        }
    }
}

fn stopped() -> WardenError {
    WardenError::NotificationChannel {
        channel: "chat",
        details: "chat worker stopped".to_string(),
    }
}

// ──────────────────── dispatcher ────────────────────

/// Fans one message out to the configured channels.
pub struct Dispatcher {
    chat: Option<ChatWorker>,
    email: Option<EmailChannel>,
    directory: Arc<dyn NamespaceDirectory>,
}

impl Dispatcher {
    /// Build from configuration with the real transports.
    pub fn from_config(
        config: &NotificationConfig,
        directory: Arc<dyn NamespaceDirectory>,
        throttle: Arc<ChatThrottle>,
    ) -> Result<Self> {
        let chat: Option<Box<dyn ChatTransport>> = (config.chat.enabled)
            .then(|| Box::new(CurlWebhook::new(&config.chat.webhook_url)) as Box<dyn ChatTransport>);
        let mail: Option<Box<dyn MailTransport>> = (config.email.enabled).then(|| {
            Box::new(SendmailTransport::new(config.email.sendmail_command.clone()))
                as Box<dyn MailTransport>
        });
        Self::with_transports(config, directory, throttle, chat, mail)
    }

    /// Build with explicit transports; a `None` transport disables that
    /// channel. An enabled chat channel starts its worker thread here.
    pub fn with_transports(
        config: &NotificationConfig,
        directory: Arc<dyn NamespaceDirectory>,
        throttle: Arc<ChatThrottle>,
        chat: Option<Box<dyn ChatTransport>>,
        mail: Option<Box<dyn MailTransport>>,
    ) -> Result<Self> {
        let enabled = config.enabled;
        let chat = chat
            .filter(|_| enabled)
            .map(|transport| {
                let channel = ChatChannel {
                    transport,
                    template: config.chat.template.clone(),
                    tag_namespace_owner: config.chat.tag_namespace_owner,
                    owner_annotation: config.chat.owner_annotation.clone(),
                };
                ChatWorker::spawn(channel, throttle, config.chat.queue_capacity)
            })
            .transpose()?;
        let email = mail.filter(|_| enabled).map(|transport| EmailChannel {
            transport,
            from: config.email.from.clone(),
            send_to_namespace_owner: config.email.send_to_namespace_owner,
            owner_annotation: config.email.owner_annotation.clone(),
            fallback_recipients: config.email.fallback_recipients.clone(),
        });
        Ok(Self {
            chat,
            email,
            directory,
        })
    }

    /// Names of active channels.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.chat.is_some() {
            names.push("chat");
        }
        if let Some(email) = &self.email {
            names.push(email.name());
        }
        names
    }

    /// Chat alerts dropped because the queue was full.
    #[must_use]
    pub fn dropped_chat_alerts(&self) -> u64 {
        self.chat
            .as_ref()
            .map_or(0, |chat| chat.dropped.load(Ordering::Relaxed))
    }
}

impl Notifier for Dispatcher {
    fn dispatch(&self, message: &NotificationMessage) -> Vec<WardenError> {
        let mut failures = Vec::new();
        if self.chat.is_none() && self.email.is_none() {
            return failures;
        }

        let annotations = self
            .directory
            .annotations(&message.namespace)
            .unwrap_or_else(|error| {
                tracing::warn!(
                    namespace = %message.namespace,
                    %error,
                    "namespace lookup failed, owners unknown"
                );
                BTreeMap::new()
            });

        if let Some(email) = &self.email
            && let Err(error) = email.send(message, &annotations)
        {
            failures.push(error);
        }
        if let Some(chat) = &self.chat
            && let Err(error) = chat.enqueue(ChatJob {
                message: message.clone(),
                annotations,
            })
        {
            failures.push(error);
        }
        failures
    }

    /// Stops the chat worker once its queue is empty; later chat alerts fail.
    fn drain(&self) {
        if let Some(chat) = &self.chat {
            chat.close();
        }
    }
}

// ──────────────────── real transports ────────────────────

/// HTTP POST through `curl`.
pub struct CurlWebhook {
    url: String,
}

impl CurlWebhook {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl ChatTransport for CurlWebhook {
    fn post(&self, body: &str) -> Result<()> {
        let output = Command::new("curl")
            .args(["--silent", "--show-error", "--fail", "--max-time", "10"])
            .args(["--header", "Content-Type: application/json"])
            .arg("--data")
            .arg(body)
            .arg(&self.url)
            .output()
            .map_err(|e| WardenError::NotificationChannel {
                channel: "chat",
                details: format!("failed to run curl: {e}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(WardenError::NotificationChannel {
                channel: "chat",
                details: format!(
                    "curl exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

/// Mail through a local `sendmail -t`.
pub struct SendmailTransport {
    command: PathBuf,
}

impl SendmailTransport {
    #[must_use]
    pub const fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

impl MailTransport for SendmailTransport {
    fn send(&self, email: &Email) -> Result<()> {
        let failure = |details: String| WardenError::NotificationChannel {
            channel: "email",
            details,
        };
        let mut child = Command::new(&self.command)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failure(format!("failed to run {}: {e}", self.command.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(email.to_rfc5322().as_bytes())
                .map_err(|e| failure(format!("failed to write message: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| failure(format!("sendmail did not finish: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(failure(format!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Reads namespace annotations with `kubectl get namespace -o json`.
pub struct KubectlNamespaceDirectory {
    kubectl: crate::daemon::executor::Kubectl,
}

impl KubectlNamespaceDirectory {
    #[must_use]
    pub const fn new(kubectl: crate::daemon::executor::Kubectl) -> Self {
        Self { kubectl }
    }
}

impl NamespaceDirectory for KubectlNamespaceDirectory {
    fn annotations(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let stdout = self
            .kubectl
            .run(&["get", "namespace", namespace, "-o", "json"])?;
        let parsed: NamespaceJson = serde_json::from_slice(&stdout)?;
        Ok(parsed.metadata.annotations)
    }
}

#[derive(Deserialize)]
struct NamespaceJson {
    #[serde(default)]
    metadata: NamespaceMetadata,
}

#[derive(Deserialize, Default)]
struct NamespaceMetadata {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// Fixed annotations per namespace, for deployments without cluster access.
#[derive(Debug, Default, Clone)]
pub struct StaticNamespaceDirectory {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticNamespaceDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, namespace: &str, key: &str, value: &str) -> Self {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl NamespaceDirectory for StaticNamespaceDirectory {
    fn annotations(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.namespaces.get(namespace).cloned().unwrap_or_default())
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::EntityKind;
    use crate::model::violation::ViolationKind;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            namespace: "payments".to_string(),
            cluster: "prod".to_string(),
            entity_kind: EntityKind::Pod,
            entity_name: "api-0".to_string(),
            violation_kind: ViolationKind::HostVolumes,
            violation_source: "/var/run/docker.sock".to_string(),
        }
    }

    #[derive(Default, Clone)]
    struct RecordingChat {
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl ChatTransport for RecordingChat {
        fn post(&self, body: &str) -> Result<()> {
            self.bodies.lock().push(body.to_string());
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingMail {
        sent: Arc<Mutex<Vec<Email>>>,
        fail: bool,
    }

    impl MailTransport for RecordingMail {
        fn send(&self, email: &Email) -> Result<()> {
            if self.fail {
                return Err(WardenError::NotificationChannel {
                    channel: "email",
                    details: "smtp down".to_string(),
                });
            }
            self.sent.lock().push(email.clone());
            Ok(())
        }
    }

    struct FailingDirectory;

    impl NamespaceDirectory for FailingDirectory {
        fn annotations(&self, _namespace: &str) -> Result<BTreeMap<String, String>> {
            Err(WardenError::Runtime {
                details: "kubectl missing".to_string(),
            })
        }
    }

    fn config() -> NotificationConfig {
        let mut config = NotificationConfig::default();
        config.chat.enabled = true;
        config.chat.webhook_url = "https://chat.example.com/hook".to_string();
        config.chat.tag_namespace_owner = true;
        config.email.enabled = true;
        config.email.from = "warden@example.com".to_string();
        config.email.fallback_recipients = vec!["sre@example.com".to_string()];
        config
    }

    fn dispatcher(
        config: &NotificationConfig,
        directory: Arc<dyn NamespaceDirectory>,
        chat: &RecordingChat,
        mail: &RecordingMail,
    ) -> Dispatcher {
        Dispatcher::with_transports(
            config,
            directory,
            Arc::new(ChatThrottle::new(Duration::ZERO)),
            Some(Box::new(chat.clone())),
            Some(Box::new(mail.clone())),
        )
        .unwrap()
    }

    /// Blocks every post until the test drops the gate's sender.
    struct GatedChat {
        gate: crossbeam_channel::Receiver<()>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl ChatTransport for GatedChat {
        fn post(&self, body: &str) -> Result<()> {
            let _ = self.gate.recv();
            self.bodies.lock().push(body.to_string());
            Ok(())
        }
    }

    #[test]
    fn message_fields_follow_fingerprint() {
        let message = NotificationMessage::new(&fingerprint(), 2, true);
        assert_eq!(message.entity_type, "Pod Name");
        assert_eq!(message.violation_type, "Host Volumes Mounted");
        assert_eq!(message.warning_count, 3);
        assert_eq!(message.subject(), "LAST WARNING: Kubernetes Violation!");
        assert_eq!(message.color(), "red");
        let html = message.render_html();
        assert!(html.contains("<b>payments</b>"));
        assert!(html.contains("Warning Count: 3"));
        assert!(html.contains("last warning before taking action"));
    }

    #[test]
    fn ordinary_warning_is_yellow_without_banner() {
        let message = NotificationMessage::new(&fingerprint(), 0, false);
        assert_eq!(message.subject(), "Kubernetes Violation!");
        assert_eq!(message.color(), "yellow");
        assert!(!message.render_html().contains("last warning"));
    }

    #[test]
    fn html_values_are_escaped() {
        let mut fp = fingerprint();
        fp.violation_source = "<script>".to_string();
        let html = NotificationMessage::new(&fp, 0, false).render_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn owners_are_tagged_then_alert_posted() {
        let chat = RecordingChat::default();
        let mail = RecordingMail::default();
        let directory = StaticNamespaceDirectory::new()
            .with("payments", "team/chat-ids", "alice, @bob")
            .with("payments", "team/email-ids", "pay@example.com,ops@example.com");
        let d = dispatcher(&config(), Arc::new(directory), &chat, &mail);

        let failures = d.dispatch(&NotificationMessage::new(&fingerprint(), 0, false));
        d.drain();
        assert!(failures.is_empty());

        let bodies = chat.bodies.lock();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].contains("@alice @bob"));
        assert!(bodies[0].contains(r#""message_format":"text""#));
        assert!(bodies[1].contains(r#""color":"yellow""#));
        let _: serde_json::Value = serde_json::from_str(&bodies[1]).unwrap();

        let sent = mail.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].to,
            vec!["pay@example.com".to_string(), "ops@example.com".to_string()]
        );
    }

    #[test]
    fn missing_annotation_uses_fallback() {
        let chat = RecordingChat::default();
        let mail = RecordingMail::default();
        let d = dispatcher(
            &config(),
            Arc::new(StaticNamespaceDirectory::new()),
            &chat,
            &mail,
        );
        d.dispatch(&NotificationMessage::new(&fingerprint(), 0, true));
        d.drain();

        assert_eq!(chat.bodies.lock().len(), 1, "no owner mention without annotation");
        let sent = mail.sent.lock();
        assert_eq!(sent[0].to, vec!["sre@example.com".to_string()]);
        assert_eq!(sent[0].subject, "LAST WARNING: Kubernetes Violation!");
    }

    #[test]
    fn owner_mail_disabled_uses_fallback() {
        let mut config = config();
        config.email.send_to_namespace_owner = false;
        let mail = RecordingMail::default();
        let directory =
            StaticNamespaceDirectory::new().with("payments", "team/email-ids", "pay@example.com");
        let d = dispatcher(&config, Arc::new(directory), &RecordingChat::default(), &mail);
        d.dispatch(&NotificationMessage::new(&fingerprint(), 0, false));
        assert_eq!(mail.sent.lock()[0].to, vec!["sre@example.com".to_string()]);
    }

    #[test]
    fn no_recipients_skips_email() {
        let mut config = config();
        config.email.fallback_recipients.clear();
        let mail = RecordingMail::default();
        let d = dispatcher(
            &config,
            Arc::new(StaticNamespaceDirectory::new()),
            &RecordingChat::default(),
            &mail,
        );
        assert!(d.dispatch(&NotificationMessage::new(&fingerprint(), 0, false)).is_empty());
        assert!(mail.sent.lock().is_empty());
    }

    #[test]
    fn email_failure_does_not_block_chat() {
        let chat = RecordingChat::default();
        let mail = RecordingMail {
            fail: true,
            ..RecordingMail::default()
        };
        let d = dispatcher(&config(), Arc::new(FailingDirectory), &chat, &mail);
        let failures = d.dispatch(&NotificationMessage::new(&fingerprint(), 0, false));
        d.drain();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].code(), "CW-2202");
        assert_eq!(chat.bodies.lock().len(), 1);
    }

    #[test]
    fn master_switch_disables_everything() {
        let mut config = config();
        config.enabled = false;
        let chat = RecordingChat::default();
        let mail = RecordingMail::default();
        let d = dispatcher(&config, Arc::new(StaticNamespaceDirectory::new()), &chat, &mail);
        assert!(d.channel_names().is_empty());
        d.dispatch(&NotificationMessage::new(&fingerprint(), 0, false));
        d.drain();
        assert!(chat.bodies.lock().is_empty());
        assert!(mail.sent.lock().is_empty());
    }

    #[test]
    fn chat_alerts_are_sent_in_order() {
        let chat = RecordingChat::default();
        let d = dispatcher(
            &config(),
            Arc::new(StaticNamespaceDirectory::new()),
            &chat,
            &RecordingMail::default(),
        );
        for count in 0..50 {
            assert!(d.dispatch(&NotificationMessage::new(&fingerprint(), count, false)).is_empty());
        }
        d.drain();

        let bodies = chat.bodies.lock();
        assert_eq!(bodies.len(), 50);
        for (index, body) in bodies.iter().enumerate() {
            assert!(
                body.contains(&format!("Warning Count: {}</li>", index + 1)),
                "alert {index} out of order"
            );
        }
        assert_eq!(d.dropped_chat_alerts(), 0);
    }

    #[test]
    fn full_chat_queue_drops_and_counts() {
        let mut config = config();
        config.chat.queue_capacity = 2;
        config.email.enabled = false;
        let (release, gate) = crossbeam_channel::bounded::<()>(0);
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let d = Dispatcher::with_transports(
            &config,
            Arc::new(StaticNamespaceDirectory::new()),
            Arc::new(ChatThrottle::new(Duration::ZERO)),
            Some(Box::new(GatedChat {
                gate,
                bodies: Arc::clone(&bodies),
            })),
            None,
        )
        .unwrap();

        // The worker holds at most one alert; two more fit in the queue.
        let failures: Vec<WardenError> = (0..5)
            .flat_map(|count| d.dispatch(&NotificationMessage::new(&fingerprint(), count, false)))
            .collect();
        assert!(failures.len() >= 2);
        assert!(failures.iter().all(|e| e.code() == "CW-2202"));
        assert_eq!(d.dropped_chat_alerts(), failures.len() as u64);

        drop(release);
        d.drain();
        assert_eq!(bodies.lock().len() + failures.len(), 5);
    }

    #[test]
    fn chat_after_drain_is_reported() {
        let chat = RecordingChat::default();
        let mut config = config();
        config.email.enabled = false;
        let d = dispatcher(
            &config,
            Arc::new(StaticNamespaceDirectory::new()),
            &chat,
            &RecordingMail::default(),
        );
        d.drain();
        let failures = d.dispatch(&NotificationMessage::new(&fingerprint(), 0, false));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("chat worker stopped"));
        assert!(chat.bodies.lock().is_empty());
    }

    #[test]
    fn chat_body_stays_valid_json_with_control_characters() {
        let mut fp = fingerprint();
        fp.violation_source = "mount\u{1}\u{1f}\u{7f}\"/x".to_string();
        let chat = RecordingChat::default();
        let d = dispatcher(
            &config(),
            Arc::new(StaticNamespaceDirectory::new()),
            &chat,
            &RecordingMail::default(),
        );
        d.dispatch(&NotificationMessage::new(&fp, 0, false));
        d.drain();

        let bodies = chat.bodies.lock();
        let body: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("mount\u{1}\u{1f}\u{7f}"));
    }

    #[test]
    fn json_escaping_matches_serde() {
        assert_eq!(escape_json("a\"b\\c\n"), r#"a\"b\\c\n"#);
        assert_eq!(escape_json("\u{1}"), r"\u0001");
        assert_eq!(escape_json("plain"), "plain");
    }

    #[test]
    fn throttle_spaces_consecutive_sends() {
        let throttle = ChatThrottle::new(Duration::from_millis(50));
        assert_eq!(throttle.wait_turn(), Duration::ZERO);
        let start = Instant::now();
        let slept = throttle.wait_turn();
        assert!(slept > Duration::ZERO);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn throttle_serializes_concurrent_senders() {
        let throttle = Arc::new(ChatThrottle::new(Duration::from_millis(30)));
        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let t = Arc::clone(&throttle);
                thread::spawn(move || {
                    t.wait_turn();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Three sends need at least two full intervals between them.
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn rfc5322_has_headers_and_body() {
        let email = Email {
            from: "warden@example.com".to_string(),
            to: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            subject: "Kubernetes Violation!".to_string(),
            html_body: "<p>hi</p>".to_string(),
        };
        let text = email.to_rfc5322();
        assert!(text.starts_with("From: warden@example.com\r\n"));
        assert!(text.contains("To: a@example.com, b@example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n<p>hi</p>"));
    }

    #[test]
    fn namespace_json_annotations_parse() {
        let raw = br#"{"metadata":{"name":"payments","annotations":{"team/email-ids":"a@example.com"}}}"#;
        let parsed: NamespaceJson = serde_json::from_slice(raw).unwrap();
        assert_eq!(
            parsed.metadata.annotations.get("team/email-ids").map(String::as_str),
            Some("a@example.com")
        );
        let bare: NamespaceJson = serde_json::from_slice(br#"{"metadata":{}}"#).unwrap();
        assert!(bare.metadata.annotations.is_empty());
    }
}
