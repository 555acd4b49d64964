use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{Local, SecondsFormat, Utc};
use rand::{rngs::OsRng, Rng};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, NetworkOptions, QoS};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use envmon_common::{
    correlator::is_key_fetch_id,
    export,
    session::random_hex,
    AiRequest, AiResponse, Channel, ConnectionState, ControlMessage, ControlState, DeviceVersions,
    HistoryRequest, HistoryResponse, MonitorError, Preferences, RangeSelector, ReconnectDecision,
    Reconnector, RedrawDecision, RedrawGate, RequestCorrelator, RequestPurpose, RuntimeConfig,
    TelemetryBuffer, TelemetryReading, UserSession, KEY_FETCH_MARKER, MAX_MQTT_PAYLOAD_BYTES,
    TOPIC_AI_REQUEST, TOPIC_AI_RESPONSE, TOPIC_DEVICE_CONTROL, TOPIC_HISTORY_DATA,
    TOPIC_HISTORY_REQUEST, TOPIC_TELEMETRY,
};

use crate::ai::{Assistant, EnvironmentSnapshot};

/// State transitions a presentation layer would render. The core only
/// emits; the built-in consumer logs them.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    ConnectionChanged(ConnectionState),
    WindowUpdated,
    HistoryLoaded { count: usize },
    ControlChanged(ControlState),
    VersionsChanged(DeviceVersions),
    ApiKeyStored,
    KeyFetchFailed { reason: String },
    KeyFetchTimedOut,
    SessionEnded { username: String },
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<RuntimeConfig>,
    session: Arc<Mutex<Option<UserSession>>>,
    connection: Arc<Mutex<ConnectionState>>,
    buffer: Arc<Mutex<TelemetryBuffer>>,
    redraw: Arc<Mutex<RedrawGate>>,
    control: Arc<Mutex<ControlState>>,
    versions: Arc<Mutex<DeviceVersions>>,
    last_reading_at: Arc<Mutex<Option<String>>>,
    reconnect: Arc<Mutex<Reconnector>>,
    correlator: Arc<Mutex<RequestCorrelator>>,
    assistant: Arc<Mutex<Assistant>>,
    prefs: Arc<Mutex<Preferences>>,
    ai_prompted: Arc<AtomicBool>,
    mqtt: AsyncClient,
    events: mpsc::UnboundedSender<CoreEvent>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    preferences_path: Arc<PathBuf>,
    export_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppState {
    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    async fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock().await = state;
        self.emit(CoreEvent::ConnectionChanged(state));
    }

    async fn is_admin(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(UserSession::is_admin)
    }

    async fn client_id(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client_id.clone())
    }

    async fn end_session(&self) {
        let username = { self.session.lock().await.take().map(|s| s.username) };
        if let Some(username) = username {
            self.emit(CoreEvent::SessionEnded { username });
        }
        self.correlator.lock().await.clear();
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut prefs = store.load_preferences().await.unwrap_or_else(|err| {
        warn!("failed to load preferences from store: {err:#}");
        Preferences::default()
    });

    let mut config = RuntimeConfig::default();
    config.sanitize();

    let host = std::env::var("MQTT_HOST")
        .ok()
        .or_else(|| prefs.broker_host.clone())
        .unwrap_or_else(|| config.broker.host.clone());
    let port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .or(prefs.broker_port)
        .unwrap_or(config.broker.port);

    let username = std::env::var("MQTT_USER")
        .ok()
        .or_else(|| prefs.username.clone())
        .unwrap_or_default();
    let password = std::env::var("MQTT_PASS").unwrap_or_default();

    let (session, password) = UserSession::login(&username, &password)
        .context("login failed; set MQTT_USER and MQTT_PASS")?;
    info!(
        "session started for {} ({}) as {}",
        session.username,
        session.role.as_str(),
        session.client_id
    );

    prefs.broker_host = Some(host.clone());
    prefs.broker_port = Some(port);
    prefs.username = Some(session.username.clone());
    if let Err(err) = store.save_preferences(&prefs).await {
        warn!("failed to persist preferences: {err:#}");
    }

    let mut mqtt_options = MqttOptions::new(session.client_id.clone(), host.clone(), port);
    mqtt_options.set_keep_alive(Duration::from_secs(config.broker.keep_alive_secs));
    mqtt_options.set_clean_session(config.broker.clean_session);
    mqtt_options.set_credentials(session.username.clone(), password);
    mqtt_options.set_max_packet_size(MAX_MQTT_PAYLOAD_BYTES, MAX_MQTT_PAYLOAD_BYTES);

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 64);
    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(config.broker.connect_timeout_secs);
    eventloop.network_options = network_options;

    let (events, event_queue) = mpsc::unbounded_channel();
    let assistant = Assistant::new(
        config.ai.clone(),
        prefs.ai_api_key.clone(),
        prefs.ai_model.clone(),
    );
    let mut reconnector = Reconnector::new(config.reconnect.clone());
    reconnector.begin_attempt();

    let app_state = AppState {
        config: Arc::new(config.clone()),
        session: Arc::new(Mutex::new(Some(session))),
        connection: Arc::new(Mutex::new(ConnectionState::Connecting)),
        buffer: Arc::new(Mutex::new(TelemetryBuffer::new(config.buffer.clone()))),
        redraw: Arc::new(Mutex::new(RedrawGate::new(
            config.buffer.redraw_min_interval_ms,
        ))),
        control: Arc::new(Mutex::new(ControlState::default())),
        versions: Arc::new(Mutex::new(DeviceVersions::default())),
        last_reading_at: Arc::new(Mutex::new(None)),
        reconnect: Arc::new(Mutex::new(reconnector)),
        correlator: Arc::new(Mutex::new(RequestCorrelator::new())),
        assistant: Arc::new(Mutex::new(assistant)),
        prefs: Arc::new(Mutex::new(prefs)),
        ai_prompted: Arc::new(AtomicBool::new(false)),
        mqtt,
        events,
        store,
    };

    app_state.emit(CoreEvent::ConnectionChanged(ConnectionState::Connecting));
    spawn_event_logger(app_state.clone(), event_queue);
    let mqtt_task = spawn_mqtt_loop(app_state.clone(), eventloop);

    info!("monitor core connecting to {host}:{port}");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        _ = mqtt_task => {
            info!("mqtt loop ended");
        }
    }

    shutdown(&app_state).await;
    Ok(())
}

async fn shutdown(app_state: &AppState) {
    let csv = {
        let buffer = app_state.buffer.lock().await;
        export::window_to_csv(&buffer)
    };
    match csv {
        Ok(contents) => {
            let filename = export::export_filename(Local::now().naive_local());
            match app_state.store.write_export(&filename, &contents).await {
                Ok(path) => info!("telemetry window exported to {}", path.display()),
                Err(err) => warn!("telemetry export failed: {err:#}"),
            }
        }
        Err(err) => info!("skipping telemetry export: {err}"),
    }

    app_state.end_session().await;
    if let Err(err) = app_state.mqtt.disconnect().await {
        debug!("mqtt disconnect failed: {err}");
    }
}

fn spawn_event_logger(app_state: AppState, mut queue: mpsc::UnboundedReceiver<CoreEvent>) {
    tokio::spawn(async move {
        while let Some(event) = queue.recv().await {
            match event {
                CoreEvent::ConnectionChanged(state) => info!("connection {}", state.as_str()),
                CoreEvent::WindowUpdated => {
                    let line = {
                        let buffer = app_state.buffer.lock().await;
                        describe_window(&buffer)
                    };
                    info!("{line}");
                }
                CoreEvent::HistoryLoaded { count } => info!("history loaded: {count} records"),
                CoreEvent::ControlChanged(control) => {
                    info!("device control: Auto={} Light={}", control.auto, control.light)
                }
                CoreEvent::VersionsChanged(versions) => info!(
                    "device firmware: stm {} esp {}",
                    versions.stm.as_deref().unwrap_or("?"),
                    versions.esp.as_deref().unwrap_or("?")
                ),
                CoreEvent::ApiKeyStored => info!("assistant API key stored"),
                CoreEvent::KeyFetchFailed { reason } => warn!("API key fetch failed: {reason}"),
                CoreEvent::KeyFetchTimedOut => warn!("API key fetch timed out"),
                CoreEvent::SessionEnded { username } => info!("session ended for {username}"),
            }
        }
    });
}

fn describe_window(buffer: &TelemetryBuffer) -> String {
    let mut parts = Vec::with_capacity(Channel::CHARTED.len());
    for channel in Channel::CHARTED {
        match (buffer.latest(channel), buffer.stats(channel)) {
            (Some(latest), Some(stats)) => parts.push(format!(
                "{} {} {} {}",
                channel.as_str(),
                latest,
                channel.unit(),
                stats.trend.arrow()
            )),
            _ => parts.push(format!("{} ?", channel.as_str())),
        }
    }
    format!("window[{}]: {}", buffer.len(), parts.join(", "))
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mut eventloop: rumqttc::EventLoop,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    on_connected(&app_state).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    if !handle_connection_loss(&app_state).await {
                        break;
                    }
                }
            }
        }
    })
}

async fn on_connected(app_state: &AppState) {
    info!("mqtt connected");
    app_state.reconnect.lock().await.connected();
    app_state.set_connection(ConnectionState::Connected).await;

    if let Err(err) = subscribe_topics(app_state).await {
        warn!("subscribe failed: {err:#}");
        return;
    }
    if let Err(err) = request_history(app_state, None).await {
        warn!("initial history request failed: {err:#}");
    }

    let key_missing = !app_state.assistant.lock().await.has_api_key();
    if key_missing {
        if let Err(err) = start_key_fetch(app_state).await {
            warn!("API key fetch not started: {err}");
        }
    }
}

/// Maps a dropped connection to either a delayed retry or the end of the
/// session. Returns false once the retry budget is spent.
async fn handle_connection_loss(app_state: &AppState) -> bool {
    app_state.set_connection(ConnectionState::Disconnected).await;

    let decision = {
        let reconnect = app_state.reconnect.lock().await;
        reconnect.connection_lost(OsRng.gen::<f64>())
    };

    match decision {
        ReconnectDecision::RetryAfter(delay_ms) => {
            info!("reconnecting in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let attempt = app_state.reconnect.lock().await.begin_attempt();
            debug!("reconnect attempt {attempt}");
            app_state.set_connection(ConnectionState::Connecting).await;
            true
        }
        ReconnectDecision::GiveUp => {
            warn!("retry budget exhausted, ending session");
            app_state.set_connection(ConnectionState::Failed).await;
            app_state.end_session().await;
            false
        }
    }
}

async fn subscribe_topics(app_state: &AppState) -> anyhow::Result<()> {
    let topics = [TOPIC_TELEMETRY, TOPIC_HISTORY_DATA];
    for topic in topics {
        app_state.mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    if app_state.is_admin().await {
        app_state
            .mqtt
            .subscribe(TOPIC_DEVICE_CONTROL, QoS::AtMostOnce)
            .await?;
    }
    Ok(())
}

/// Publishes a history request for the given range, or the preferred one
/// when `range` is `None`. An explicit range choice is persisted.
pub async fn request_history(
    app_state: &AppState,
    range: Option<RangeSelector>,
) -> anyhow::Result<()> {
    let Some(client_id) = app_state.client_id().await else {
        anyhow::bail!("no active session");
    };

    let range = match range {
        Some(range) => {
            let snapshot = {
                let mut prefs = app_state.prefs.lock().await;
                prefs.range = range;
                prefs.clone()
            };
            if let Err(err) = app_state.store.save_preferences(&snapshot).await {
                warn!("failed to persist range selection: {err:#}");
            }
            range
        }
        None => app_state.prefs.lock().await.range,
    };

    let request = HistoryRequest {
        client_id,
        number: range.wire_number(),
    };
    let payload = serde_json::to_vec(&request)?;
    app_state
        .mqtt
        .publish(TOPIC_HISTORY_REQUEST, QoS::AtLeastOnce, false, payload)
        .await?;
    info!("requested {} of history", range.as_str());
    Ok(())
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;

    match topic.as_str() {
        TOPIC_TELEMETRY => handle_telemetry(app_state, &message).await?,
        TOPIC_HISTORY_DATA => handle_history(app_state, &message).await?,
        TOPIC_DEVICE_CONTROL => handle_device_control(app_state, &message).await?,
        TOPIC_AI_RESPONSE => handle_ai_response(app_state, &message).await?,
        _ => {}
    }

    Ok(())
}

async fn handle_telemetry(app_state: &AppState, message: &str) -> anyhow::Result<()> {
    let reading: TelemetryReading =
        serde_json::from_str(message).context("bad telemetry payload")?;

    let versions_changed = {
        let mut versions = app_state.versions.lock().await;
        versions.merge_from(&reading)
    };
    if versions_changed {
        let versions = app_state.versions.lock().await.clone();
        app_state.emit(CoreEvent::VersionsChanged(versions));
    }

    let now = Local::now();
    *app_state.last_reading_at.lock().await =
        Some(now.format("%Y-%m-%d %H:%M:%S").to_string());
    {
        let mut buffer = app_state.buffer.lock().await;
        buffer.append_live(&reading, now.format("%H:%M:%S").to_string());
    }

    let decision = app_state.redraw.lock().await.on_update(monotonic_ms());
    match decision {
        RedrawDecision::Now => app_state.emit(CoreEvent::WindowUpdated),
        RedrawDecision::Schedule(delay_ms) => {
            let state = app_state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if state.redraw.lock().await.on_timer(monotonic_ms()) {
                    state.emit(CoreEvent::WindowUpdated);
                }
            });
        }
        RedrawDecision::AlreadyPending => {}
    }

    Ok(())
}

async fn handle_history(app_state: &AppState, message: &str) -> anyhow::Result<()> {
    let response: HistoryResponse =
        serde_json::from_str(message).context("bad history payload")?;

    let Some(ours) = app_state.client_id().await else {
        return Ok(());
    };
    if response
        .client_id
        .as_deref()
        .is_some_and(|theirs| theirs != ours)
    {
        debug!("ignoring history reply for another client");
        return Ok(());
    }

    let fallback = Local::now().format("%H:%M:%S").to_string();
    let count = {
        let mut buffer = app_state.buffer.lock().await;
        buffer.load_historical(&response.data, &fallback)
    };

    app_state.emit(CoreEvent::HistoryLoaded { count });
    // Historical refreshes repaint immediately and leave the live throttle alone.
    app_state.emit(CoreEvent::WindowUpdated);

    maybe_run_scripted_prompt(app_state);
    Ok(())
}

async fn handle_device_control(app_state: &AppState, message: &str) -> anyhow::Result<()> {
    let control_message: ControlMessage =
        serde_json::from_str(message).context("bad control payload")?;

    let applied = {
        let mut control = app_state.control.lock().await;
        control.apply(&control_message)
    };
    if applied {
        let control = *app_state.control.lock().await;
        app_state.emit(CoreEvent::ControlChanged(control));
    }
    Ok(())
}

async fn handle_ai_response(app_state: &AppState, message: &str) -> anyhow::Result<()> {
    let response: AiResponse = serde_json::from_str(message).context("bad api reply payload")?;

    let Some(ours) = app_state.client_id().await else {
        return Ok(());
    };
    if response
        .client_id
        .as_deref()
        .is_some_and(|theirs| theirs != ours)
    {
        debug!("ignoring api reply for another client");
        return Ok(());
    }

    let request_id = response.request_id.clone().unwrap_or_default();
    if !is_key_fetch_id(&request_id) {
        debug!("ignoring non key-fetch api reply {request_id}");
        return Ok(());
    }
    if app_state.correlator.lock().await.complete(&request_id).is_none() {
        debug!("stale api reply {request_id}");
        return Ok(());
    }

    if let Err(err) = app_state.mqtt.unsubscribe(TOPIC_AI_RESPONSE).await {
        debug!("unsubscribe failed: {err}");
    }

    match (response.success.unwrap_or(false), response.result) {
        (true, Some(key)) if !key.trim().is_empty() => {
            store_api_key(app_state, key.trim().to_string()).await;
        }
        _ => {
            let reason = response.error.unwrap_or_else(|| "API call failed".to_string());
            app_state.emit(CoreEvent::KeyFetchFailed { reason });
        }
    }
    Ok(())
}

async fn store_api_key(app_state: &AppState, key: String) {
    app_state.assistant.lock().await.set_api_key(key.clone());
    let snapshot = {
        let mut prefs = app_state.prefs.lock().await;
        prefs.ai_api_key = Some(key);
        prefs.clone()
    };
    if let Err(err) = app_state.store.save_preferences(&snapshot).await {
        warn!("failed to persist API key: {err:#}");
    }
    app_state.emit(CoreEvent::ApiKeyStored);
}

/// Requests the assistant API key over the broker. The reply topic is
/// subscribed before the request goes out so the answer cannot race past
/// us, and a timer reclaims the pending slot if nothing arrives.
pub async fn start_key_fetch(app_state: &AppState) -> Result<(), MonitorError> {
    if app_state.assistant.lock().await.has_api_key() {
        return Err(MonitorError::validation("API key already configured"));
    }
    let Some(client_id) = app_state.client_id().await else {
        return Err(MonitorError::validation("no active session"));
    };

    let timeout_ms = app_state.config.ai.key_fetch_timeout_ms;
    let request_id = {
        let mut correlator = app_state.correlator.lock().await;
        correlator.begin(
            RequestPurpose::KeyFetch,
            Utc::now().timestamp_millis() as u64,
            &random_hex(9),
            Some(timeout_ms),
        )?
    };

    app_state
        .mqtt
        .subscribe(TOPIC_AI_RESPONSE, QoS::AtLeastOnce)
        .await
        .map_err(MonitorError::transport)?;

    let request = AiRequest {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        client_id,
        message: KEY_FETCH_MARKER.to_string(),
        request_id: request_id.clone(),
    };
    let payload = serde_json::to_vec(&request)?;
    app_state
        .mqtt
        .publish(TOPIC_AI_REQUEST, QoS::AtLeastOnce, false, payload)
        .await
        .map_err(MonitorError::transport)?;
    info!("API key fetch started ({request_id})");

    let state = app_state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        let expired = state.correlator.lock().await.cancel(&request_id).is_some();
        if expired {
            if let Err(err) = state.mqtt.unsubscribe(TOPIC_AI_RESPONSE).await {
                debug!("unsubscribe failed: {err}");
            }
            state.emit(CoreEvent::KeyFetchTimedOut);
        }
    });

    Ok(())
}

fn maybe_run_scripted_prompt(app_state: &AppState) {
    let Ok(prompt) = std::env::var("ENVMON_AI_PROMPT") else {
        return;
    };
    if prompt.trim().is_empty() || app_state.ai_prompted.swap(true, Ordering::SeqCst) {
        return;
    }
    let state = app_state.clone();
    tokio::spawn(async move {
        match ask_assistant(&state, &prompt).await {
            Ok(reply) => info!("assistant: {reply}"),
            Err(err) => warn!("assistant request failed: {err}"),
        }
    });
}

/// Asks the assistant a question against a snapshot of the current
/// window. Needs a logged-in session and a live broker connection.
pub async fn ask_assistant(
    app_state: &AppState,
    question: &str,
) -> Result<String, MonitorError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(MonitorError::validation("empty question"));
    }
    if app_state.session.lock().await.is_none() {
        return Err(MonitorError::validation("no active session"));
    }
    if *app_state.connection.lock().await != ConnectionState::Connected {
        return Err(MonitorError::validation("not connected to the broker"));
    }
    let taken_at = app_state
        .last_reading_at
        .lock()
        .await
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let snapshot = {
        let buffer = app_state.buffer.lock().await;
        EnvironmentSnapshot::capture(&buffer, taken_at)
    };
    let mut assistant = app_state.assistant.lock().await;
    assistant.ask(question, &snapshot).await
}

/// Switches automatic mode on or off, keeping the cached light value.
pub async fn set_auto(app_state: &AppState, enabled: bool) -> Result<(), MonitorError> {
    let light = app_state.control.lock().await.light;
    send_control(app_state, ControlMessage::command(u8::from(enabled), light)).await
}

/// Drives the light directly. A manual light command always drops the
/// device out of automatic mode.
pub async fn set_light(app_state: &AppState, on: bool) -> Result<(), MonitorError> {
    send_control(app_state, ControlMessage::command(0, u8::from(on))).await
}

async fn send_control(
    app_state: &AppState,
    message: ControlMessage,
) -> Result<(), MonitorError> {
    if !app_state.is_admin().await {
        return Err(MonitorError::authorization(
            "device control requires the admin account",
        ));
    }

    let payload = serde_json::to_vec(&message)?;
    app_state
        .mqtt
        .publish(TOPIC_DEVICE_CONTROL, QoS::AtLeastOnce, false, payload)
        .await
        .map_err(MonitorError::transport)?;

    // Commands carry DriveStatus 1 and would be ignored by apply(); the
    // local cache is updated optimistically instead.
    let changed = {
        let mut control = app_state.control.lock().await;
        let before = *control;
        if let Some(auto) = message.auto {
            control.auto = auto;
        }
        if let Some(light) = message.light {
            control.light = light;
        }
        *control != before
    };
    if changed {
        let control = *app_state.control.lock().await;
        app_state.emit(CoreEvent::ControlChanged(control));
    }
    Ok(())
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("ENVMON_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.envmon"));

        Self {
            preferences_path: Arc::new(data_dir.join("preferences.json")),
            export_dir: Arc::new(data_dir.join("exports")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_preferences(&self) -> anyhow::Result<Preferences> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.preferences_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<Preferences>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Preferences::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_preferences(&self, prefs: &Preferences) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.preferences_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(prefs)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn write_export(&self, filename: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let dir = self.export_dir.as_ref().clone();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_state(
        username: &str,
    ) -> (
        AppState,
        mpsc::UnboundedReceiver<CoreEvent>,
        rumqttc::EventLoop,
    ) {
        let config = RuntimeConfig::default();
        let (mqtt, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 16);
        let (events, queue) = mpsc::unbounded_channel();
        let (session, _password) = UserSession::login(username, "secret").unwrap();

        let data_dir = std::env::temp_dir().join(format!("envmon-core-test-{}", random_hex(8)));
        let store = AppStore {
            preferences_path: Arc::new(data_dir.join("preferences.json")),
            export_dir: Arc::new(data_dir.join("exports")),
            lock: Arc::new(Mutex::new(())),
        };

        let state = AppState {
            config: Arc::new(config.clone()),
            session: Arc::new(Mutex::new(Some(session))),
            connection: Arc::new(Mutex::new(ConnectionState::Connecting)),
            buffer: Arc::new(Mutex::new(TelemetryBuffer::new(config.buffer.clone()))),
            redraw: Arc::new(Mutex::new(RedrawGate::new(
                config.buffer.redraw_min_interval_ms,
            ))),
            control: Arc::new(Mutex::new(ControlState::default())),
            versions: Arc::new(Mutex::new(DeviceVersions::default())),
            last_reading_at: Arc::new(Mutex::new(None)),
            reconnect: Arc::new(Mutex::new(Reconnector::new(config.reconnect.clone()))),
            correlator: Arc::new(Mutex::new(RequestCorrelator::new())),
            assistant: Arc::new(Mutex::new(Assistant::new(config.ai.clone(), None, None))),
            prefs: Arc::new(Mutex::new(Preferences::default())),
            ai_prompted: Arc::new(AtomicBool::new(false)),
            mqtt,
            events,
            store,
        };
        (state, queue, eventloop)
    }

    async fn our_client_id(state: &AppState) -> String {
        state.client_id().await.unwrap()
    }

    #[tokio::test]
    async fn control_commands_require_admin() {
        let (state, mut queue, _eventloop) = test_state("viewer");

        let err = set_light(&state, true).await.unwrap_err();
        assert!(matches!(err, MonitorError::Authorization(_)));
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_light_command_drops_auto_mode() {
        let (state, mut queue, _eventloop) = test_state("admin");
        state.control.lock().await.auto = 1;

        set_light(&state, true).await.unwrap();

        let control = *state.control.lock().await;
        assert_eq!(control, ControlState { auto: 0, light: 1 });
        assert_eq!(
            queue.try_recv().unwrap(),
            CoreEvent::ControlChanged(ControlState { auto: 0, light: 1 })
        );
    }

    #[tokio::test]
    async fn auto_command_keeps_current_light_value() {
        let (state, _queue, _eventloop) = test_state("admin");
        state.control.lock().await.light = 1;

        set_auto(&state, true).await.unwrap();

        let control = *state.control.lock().await;
        assert_eq!(control, ControlState { auto: 1, light: 1 });
    }

    #[tokio::test]
    async fn telemetry_appends_and_repaints_immediately() {
        let (state, mut queue, _eventloop) = test_state("viewer");

        handle_telemetry(
            &state,
            r#"{"temperature":235,"humidity":601,"stm_ver":"2.1"}"#,
        )
        .await
        .unwrap();

        assert_eq!(state.buffer.lock().await.len(), 1);
        assert!(state.last_reading_at.lock().await.is_some());
        let first = queue.try_recv().unwrap();
        assert!(matches!(first, CoreEvent::VersionsChanged(_)));
        assert_eq!(queue.try_recv().unwrap(), CoreEvent::WindowUpdated);
    }

    #[tokio::test]
    async fn second_telemetry_inside_throttle_window_is_deferred() {
        let (state, mut queue, _eventloop) = test_state("viewer");

        handle_telemetry(&state, r#"{"temperature":235}"#).await.unwrap();
        handle_telemetry(&state, r#"{"temperature":236}"#).await.unwrap();

        assert_eq!(state.buffer.lock().await.len(), 2);
        assert_eq!(queue.try_recv().unwrap(), CoreEvent::WindowUpdated);
        // The second repaint is deferred behind the throttle timer.
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_payload_is_dropped_before_parsing() {
        let (state, mut queue, _eventloop) = test_state("viewer");
        let padding = "x".repeat(MAX_MQTT_PAYLOAD_BYTES + 1);

        handle_mqtt_message(&state, TOPIC_TELEMETRY.to_string(), padding.into_bytes())
            .await
            .unwrap();

        assert!(state.buffer.lock().await.is_empty());
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_reply_for_another_client_is_ignored() {
        let (state, mut queue, _eventloop) = test_state("viewer");

        handle_history(
            &state,
            r#"{"clientId":"env-monitor-deadbeef","data":[{"date":"20260118","hour":9,"temperature":231}]}"#,
        )
        .await
        .unwrap();

        assert!(state.buffer.lock().await.is_empty());
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn addressed_history_reply_loads_and_repaints() {
        let (state, mut queue, _eventloop) = test_state("viewer");
        let ours = our_client_id(&state).await;

        let payload = format!(
            r#"{{"clientId":"{ours}","data":[{{"date":"20260118","hour":10,"temperature":240}},{{"date":"20260118","hour":9,"temperature":231}}]}}"#
        );
        handle_history(&state, &payload).await.unwrap();

        assert_eq!(state.buffer.lock().await.len(), 2);
        assert_eq!(queue.try_recv().unwrap(), CoreEvent::HistoryLoaded { count: 2 });
        assert_eq!(queue.try_recv().unwrap(), CoreEvent::WindowUpdated);
    }

    #[tokio::test]
    async fn unaddressed_history_reply_is_accepted() {
        let (state, _queue, _eventloop) = test_state("viewer");

        handle_history(&state, r#"{"data":[{"date":"20260118","temperature":231}]}"#)
            .await
            .unwrap();

        assert_eq!(state.buffer.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn device_state_updates_cache_but_command_echo_does_not() {
        let (state, mut queue, _eventloop) = test_state("viewer");

        handle_device_control(&state, r#"{"Auto":1,"Light":1,"DriveStatus":0}"#)
            .await
            .unwrap();
        assert_eq!(
            queue.try_recv().unwrap(),
            CoreEvent::ControlChanged(ControlState { auto: 1, light: 1 })
        );

        handle_device_control(&state, r#"{"Auto":0,"Light":0,"DriveStatus":1}"#)
            .await
            .unwrap();
        assert_eq!(*state.control.lock().await, ControlState { auto: 1, light: 1 });
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn key_fetch_registers_a_single_pending_request() {
        let (state, _queue, _eventloop) = test_state("viewer");

        start_key_fetch(&state).await.unwrap();
        assert!(state
            .correlator
            .lock()
            .await
            .is_pending(RequestPurpose::KeyFetch));

        let err = start_key_fetch(&state).await.unwrap_err();
        assert!(matches!(err, MonitorError::Validation(_)));
    }

    #[tokio::test]
    async fn key_reply_with_peer_minted_id_stores_the_key() {
        let (state, mut queue, _eventloop) = test_state("viewer");
        let ours = our_client_id(&state).await;
        start_key_fetch(&state).await.unwrap();
        while queue.try_recv().is_ok() {}

        let payload = format!(
            r#"{{"clientId":"{ours}","requestId":"__API_CALL__-999-peer","success":true,"result":" sk-live-key "}}"#
        );
        handle_ai_response(&state, &payload).await.unwrap();

        assert!(state.assistant.lock().await.has_api_key());
        assert!(state.correlator.lock().await.is_empty());
        assert_eq!(queue.try_recv().unwrap(), CoreEvent::ApiKeyStored);
        assert_eq!(
            state.prefs.lock().await.ai_api_key.as_deref(),
            Some("sk-live-key")
        );
    }

    #[tokio::test]
    async fn key_reply_for_another_client_keeps_request_pending() {
        let (state, _queue, _eventloop) = test_state("viewer");
        start_key_fetch(&state).await.unwrap();

        handle_ai_response(
            &state,
            r#"{"clientId":"env-monitor-deadbeef","requestId":"__API_CALL__-999-peer","success":true,"result":"sk"}"#,
        )
        .await
        .unwrap();

        assert!(state
            .correlator
            .lock()
            .await
            .is_pending(RequestPurpose::KeyFetch));
        assert!(!state.assistant.lock().await.has_api_key());
    }

    #[tokio::test]
    async fn stale_key_reply_without_pending_request_is_dropped() {
        let (state, mut queue, _eventloop) = test_state("viewer");
        let ours = our_client_id(&state).await;

        let payload = format!(
            r#"{{"clientId":"{ours}","requestId":"__API_CALL__-999-peer","success":true,"result":"sk"}}"#
        );
        handle_ai_response(&state, &payload).await.unwrap();

        assert!(!state.assistant.lock().await.has_api_key());
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_key_reply_reports_the_reason() {
        let (state, mut queue, _eventloop) = test_state("viewer");
        let ours = our_client_id(&state).await;
        start_key_fetch(&state).await.unwrap();

        let payload = format!(
            r#"{{"clientId":"{ours}","requestId":"__API_CALL__-999-peer","success":false,"error":"no key on file"}}"#
        );
        handle_ai_response(&state, &payload).await.unwrap();

        assert_eq!(
            queue.try_recv().unwrap(),
            CoreEvent::KeyFetchFailed {
                reason: "no key on file".to_string()
            }
        );
    }

    #[tokio::test]
    async fn chat_requires_a_live_broker_connection() {
        let (state, _queue, _eventloop) = test_state("viewer");
        state.assistant.lock().await.set_api_key("sk-test".to_string());
        *state.connection.lock().await = ConnectionState::Disconnected;

        // The connection gate fires even with a key on hand; nothing goes
        // out over HTTP while the link is down.
        let err = ask_assistant(&state, "how is the air outside?")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid input: not connected to the broker");

        let (keyless, _queue2, _eventloop2) = test_state("viewer");
        *keyless.connection.lock().await = ConnectionState::Connected;
        let err = ask_assistant(&keyless, "how is the air outside?")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid input: assistant API key is not configured"
        );
    }

    #[tokio::test]
    async fn missing_preferences_file_loads_defaults() {
        let (state, _queue, _eventloop) = test_state("viewer");

        let prefs = state.store.load_preferences().await.unwrap();
        assert_eq!(prefs, Preferences::default());
    }

    #[tokio::test]
    async fn explicit_range_choice_is_persisted() {
        let (state, _queue, _eventloop) = test_state("viewer");

        request_history(&state, Some(RangeSelector::OneWeek))
            .await
            .unwrap();

        assert_eq!(state.prefs.lock().await.range, RangeSelector::OneWeek);
        let stored = state.store.load_preferences().await.unwrap();
        assert_eq!(stored.range, RangeSelector::OneWeek);
    }

    #[test]
    fn window_description_shows_latest_value_and_trend() {
        let config = RuntimeConfig::default();
        let mut buffer = TelemetryBuffer::new(config.buffer);
        buffer.append_live(
            &TelemetryReading {
                temperature: Some(235),
                ..TelemetryReading::default()
            },
            "10:00:00".to_string(),
        );
        buffer.append_live(
            &TelemetryReading {
                temperature: Some(320),
                ..TelemetryReading::default()
            },
            "10:00:05".to_string(),
        );

        let line = describe_window(&buffer);
        assert!(line.starts_with("window[2]:"));
        assert!(line.contains("temperature 32 C ↑"));
    }
}
