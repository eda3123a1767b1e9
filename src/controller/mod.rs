//! Session controller
//!
//! The state machine at the heart of the client. It arbitrates between the
//! three mutually-exclusive input modes (typed text, push-to-talk recording,
//! continuous listening), owns the periodic-message scheduler and the
//! realtime channel for the current listening episode, and is the only
//! writer of the transcript.
//!
//! # Architecture
//! Everything that can happen to the session (user intents, timer firings,
//! remote-call completions, channel events) is a [`SessionEvent`] consumed
//! by a single dispatch loop in one tokio task. Remote calls are spawned and
//! complete by sending a further event into the same queue, so all mutation
//! is serialized and transcript order is completion order. Each outstanding
//! call carries the exchange or episode number it was issued under;
//! completions from a superseded exchange or a torn-down episode are
//! discarded instead of corrupting newer state.

use crate::audio::{self, AudioCaptureHandle, CaptureBackend, CaptureDevice};
use crate::channel::{ChannelConnector, ChannelEvent, ChannelHandle, ClientCommand, ServerEvent};
use crate::error::GatewayError;
use crate::gateway::{Attachment, Gateway, VoiceReply};
use crate::scheduler::PeriodicScheduler;
use crate::transcript::{Origin, Role, TranscriptEntry, TranscriptStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capture device index used until the user picks one
const DEFAULT_DEVICE_INDEX: usize = 1;

/// Which interaction mode is active
///
/// Exactly one mode is active at any instant. Recording and Listening are
/// mutually exclusive; Processing blocks new submissions until the in-flight
/// exchange settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Idle,
    Processing,
    Recording,
    Listening,
}

/// Everything that can happen to the session
#[derive(Debug)]
pub enum SessionEvent {
    // User intents
    SubmitText { input: String },
    AttachFile { attachment: Attachment },
    ClearAttachment,
    ToggleRecording,
    ToggleListening,
    SelectDevice { index: usize },

    // Timer firings
    RecordTimeout { exchange: u64 },
    PeriodicTick,

    // Remote completions
    GreetingReady { reply: Result<String, GatewayError> },
    TextExchangeDone { exchange: u64, reply: Result<String, GatewayError> },
    VoiceExchangeDone { exchange: u64, reply: Result<VoiceReply, GatewayError> },
    PeriodicMessageReady { reply: Result<String, GatewayError> },

    // Realtime channel, tagged with the episode that opened the connection
    Channel { episode: u64, event: ChannelEvent },
}

/// Timing knobs for the session controller
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Idle time between injected periodic messages
    pub periodic_interval: Duration,
    /// Bound on a single recording before it is force-stopped
    pub record_timeout: Duration,
}

/// State of one in-progress push-to-talk recording
struct ActiveRecording {
    exchange: u64,
    handle: AudioCaptureHandle,
    collector: JoinHandle<(Vec<i16>, u32)>,
    forced_stop: JoinHandle<()>,
}

pub struct SessionController {
    mode: SessionMode,
    transcript: TranscriptStore,
    scheduler: PeriodicScheduler,
    gateway: Arc<dyn Gateway>,
    connector: Arc<dyn ChannelConnector>,
    capture: Arc<dyn CaptureBackend>,
    devices: Vec<CaptureDevice>,
    device_index: usize,
    pending_upload: Option<Attachment>,
    recording: Option<ActiveRecording>,
    channel: Option<ChannelHandle>,
    exchange_seq: u64,
    episode_seq: u64,
    record_timeout: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        gateway: Arc<dyn Gateway>,
        connector: Arc<dyn ChannelConnector>,
        capture: Arc<dyn CaptureBackend>,
        devices: Vec<CaptureDevice>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = PeriodicScheduler::new(config.periodic_interval, events_tx.clone());
        Self {
            mode: SessionMode::Idle,
            transcript: TranscriptStore::new(),
            scheduler,
            gateway,
            connector,
            capture,
            devices,
            device_index: DEFAULT_DEVICE_INDEX,
            pending_upload: None,
            recording: None,
            channel: None,
            exchange_seq: 0,
            episode_seq: 0,
            record_timeout: config.record_timeout,
            events_tx,
            events_rx,
        }
    }

    /// Sender for feeding user intents into the dispatch loop
    pub fn handle(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Subscribe to appended transcript entries
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.transcript.subscribe()
    }

    /// Run the dispatch loop until the host tears the session down
    pub async fn run(mut self) {
        self.start();
        while let Some(event) = self.events_rx.recv().await {
            self.dispatch(event).await;
        }
        debug!("Session controller event loop exited");
    }

    /// Arm the scheduler and request the one-shot greeting
    fn start(&mut self) {
        self.scheduler.resume();
        let gateway = self.gateway.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = gateway.fetch_greeting().await;
            let _ = events_tx.send(SessionEvent::GreetingReady { reply });
        });
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SubmitText { input } => self.on_submit_text(input),
            SessionEvent::AttachFile { attachment } => self.on_attach_file(attachment),
            SessionEvent::ClearAttachment => {
                self.pending_upload = None;
            }
            SessionEvent::ToggleRecording => self.on_toggle_recording().await,
            SessionEvent::ToggleListening => self.on_toggle_listening().await,
            SessionEvent::SelectDevice { index } => self.on_select_device(index),
            SessionEvent::RecordTimeout { exchange } => self.on_record_timeout(exchange).await,
            SessionEvent::PeriodicTick => self.on_periodic_tick(),
            SessionEvent::GreetingReady { reply } => self.on_greeting_ready(reply),
            SessionEvent::TextExchangeDone { exchange, reply } => {
                self.on_text_exchange_done(exchange, reply)
            }
            SessionEvent::VoiceExchangeDone { exchange, reply } => {
                self.on_voice_exchange_done(exchange, reply)
            }
            SessionEvent::PeriodicMessageReady { reply } => self.on_periodic_message_ready(reply),
            SessionEvent::Channel { episode, event } => self.on_channel_event(episode, event),
        }
    }

    fn append(&mut self, role: Role, content: impl Into<String>, origin: Origin) {
        self.transcript.append(TranscriptEntry::new(role, content, origin));
    }

    /// Settle back to Idle and let the periodic timer start over
    fn finish_exchange(&mut self) {
        self.mode = SessionMode::Idle;
        self.scheduler.resume();
        self.scheduler.reset_interval();
    }

    // ---- Text submission ----

    fn on_submit_text(&mut self, input: String) {
        if self.mode != SessionMode::Idle {
            debug!("Ignoring text submission while {:?}", self.mode);
            return;
        }
        let trimmed = input.trim().to_string();
        if trimmed.is_empty() && self.pending_upload.is_none() {
            debug!("Ignoring empty text submission");
            return;
        }

        self.mode = SessionMode::Processing;
        self.scheduler.pause();

        let attachment = self.pending_upload.take();
        if attachment.is_some() {
            self.append(Role::System, "Image uploaded", Origin::ImageUpload);
        }
        // Optimistic display: the user line appears before the reply arrives
        self.append(Role::User, trimmed.clone(), Origin::AdminText);

        self.exchange_seq += 1;
        let exchange = self.exchange_seq;
        let sanitized = sanitize_text_input(&trimmed);
        let gateway = self.gateway.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = gateway.submit_message(&sanitized, attachment.as_ref()).await;
            let _ = events_tx.send(SessionEvent::TextExchangeDone { exchange, reply });
        });
    }

    fn on_text_exchange_done(&mut self, exchange: u64, reply: Result<String, GatewayError>) {
        if self.mode != SessionMode::Processing || exchange != self.exchange_seq {
            debug!("Discarding stale text exchange completion #{exchange}");
            return;
        }
        match reply {
            Ok(text) => self.append(Role::Assistant, text, Origin::AdminText),
            // Absorbed: the optimistic user line stays, the draft is gone,
            // and no error entry is shown. The user resubmits.
            Err(e) => error!("Text exchange failed: {}", e),
        }
        self.finish_exchange();
    }

    fn on_attach_file(&mut self, attachment: Attachment) {
        info!("Attached file: {}", attachment.filename);
        self.pending_upload = Some(attachment);
    }

    // ---- Push-to-talk recording ----

    async fn on_toggle_recording(&mut self) {
        match self.mode {
            SessionMode::Recording => self.stop_recording().await,
            SessionMode::Idle => self.start_recording(),
            _ => debug!("Recording toggle ignored while {:?}", self.mode),
        }
    }

    fn start_recording(&mut self) {
        let (handle, mut chunk_rx) = match self.capture.start(self.device_index) {
            Ok(capture) => capture,
            Err(e) => {
                error!("Failed to start audio capture: {}", e);
                return;
            }
        };

        self.mode = SessionMode::Recording;
        self.scheduler.pause();
        self.exchange_seq += 1;
        let exchange = self.exchange_seq;

        let collector = tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut sample_rate = 0u32;
            while let Some(chunk) = chunk_rx.recv().await {
                sample_rate = chunk.sample_rate;
                samples.extend_from_slice(&chunk.samples);
            }
            (samples, sample_rate)
        });

        // Forced stop in case the user never stops manually
        let events_tx = self.events_tx.clone();
        let bound = self.record_timeout;
        let forced_stop = tokio::spawn(async move {
            tokio::time::sleep(bound).await;
            let _ = events_tx.send(SessionEvent::RecordTimeout { exchange });
        });

        self.recording = Some(ActiveRecording {
            exchange,
            handle,
            collector,
            forced_stop,
        });
        info!("Recording started (bounded at {:?})", bound);
    }

    async fn on_record_timeout(&mut self, exchange: u64) {
        let current = self.recording.as_ref().map(|r| r.exchange);
        if self.mode != SessionMode::Recording || current != Some(exchange) {
            debug!("Ignoring stale capture bound #{exchange}");
            return;
        }
        info!("Capture bound reached, forcing stop");
        self.stop_recording().await;
    }

    async fn stop_recording(&mut self) {
        let Some(mut recording) = self.recording.take() else {
            return;
        };
        recording.forced_stop.abort();
        recording.handle.stop();

        self.mode = SessionMode::Processing;

        let (samples, sample_rate) = match recording.collector.await {
            Ok(captured) => captured,
            Err(e) => {
                error!("Capture collector failed: {}", e);
                (Vec::new(), 0)
            }
        };
        info!(
            "Recording stopped ({} samples at {} Hz)",
            samples.len(),
            sample_rate
        );

        let wav = match audio::encode_wav(&samples, sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                error!("Failed to package recorded audio: {}", e);
                self.finish_exchange();
                return;
            }
        };

        let exchange = recording.exchange;
        let gateway = self.gateway.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = gateway.submit_voice(wav).await;
            let _ = events_tx.send(SessionEvent::VoiceExchangeDone { exchange, reply });
        });
    }

    fn on_voice_exchange_done(&mut self, exchange: u64, reply: Result<VoiceReply, GatewayError>) {
        if self.mode != SessionMode::Processing || exchange != self.exchange_seq {
            debug!("Discarding stale voice exchange completion #{exchange}");
            return;
        }
        match reply {
            Ok(voice) => {
                self.append(Role::User, voice.transcription, Origin::VoiceRecording);
                self.append(Role::Assistant, voice.ai_response, Origin::VoiceRecording);
            }
            Err(e) => error!("Voice exchange failed: {}", e),
        }
        self.finish_exchange();
    }

    // ---- Continuous listening ----

    async fn on_toggle_listening(&mut self) {
        match self.mode {
            SessionMode::Listening => self.exit_listening(),
            SessionMode::Idle => self.enter_listening().await,
            _ => debug!("Listening toggle ignored while {:?}", self.mode),
        }
    }

    async fn enter_listening(&mut self) {
        self.episode_seq += 1;
        let episode = self.episode_seq;
        // Paused for the entire listening duration
        self.scheduler.pause();

        match self
            .connector
            .open(self.device_index, episode, self.events_tx.clone())
            .await
        {
            Ok(handle) => {
                handle.send(ClientCommand::BeginCapture {
                    device_index: self.device_index,
                });
                self.channel = Some(handle);
                self.mode = SessionMode::Listening;
                info!(
                    "Listening started (episode {episode}, device {})",
                    self.device_index
                );
            }
            Err(e) => {
                error!("Failed to open realtime channel: {}", e);
                self.scheduler.resume();
                self.scheduler.reset_interval();
            }
        }
    }

    /// Tear down the current episode and settle back to Idle
    ///
    /// Safe for every exit trigger: user toggle, server quit/deactivated,
    /// server error, transport disconnect.
    fn exit_listening(&mut self) {
        if let Some(mut handle) = self.channel.take() {
            if handle.is_connected() {
                handle.send(ClientCommand::EndCapture);
            }
            handle.close();
        }
        self.mode = SessionMode::Idle;
        self.scheduler.resume();
        self.scheduler.reset_interval();
        info!("Listening ended");
    }

    fn on_channel_event(&mut self, episode: u64, event: ChannelEvent) {
        if self.mode != SessionMode::Listening || episode != self.episode_seq {
            debug!("Discarding channel event from stale episode #{episode}");
            return;
        }
        match event {
            ChannelEvent::Event(ServerEvent::Result {
                transcription,
                ai_response,
            }) => {
                self.append(Role::User, transcription, Origin::LiveListening);
                self.append(Role::Assistant, ai_response, Origin::LiveListening);
                self.rearm_capture();
            }
            ChannelEvent::Event(ServerEvent::PeriodicMessage { message }) => {
                self.append(Role::Assistant, message, Origin::Periodic);
                self.rearm_capture();
            }
            ChannelEvent::Event(ServerEvent::Deactivated { ai_response }) => {
                info!("Listening deactivated by server for inactivity");
                self.append(Role::Assistant, ai_response, Origin::LiveListening);
                self.exit_listening();
            }
            ChannelEvent::Event(ServerEvent::Error { message }) => {
                error!("Listening error: {}", message);
                self.exit_listening();
            }
            ChannelEvent::Event(ServerEvent::Quit {
                transcription,
                ai_response,
            }) => {
                info!("Exit keyword detected, leaving listening mode");
                self.append(Role::User, transcription, Origin::LiveListening);
                self.append(Role::Assistant, ai_response, Origin::LiveListening);
                self.exit_listening();
            }
            ChannelEvent::Disconnected => {
                warn!("Realtime channel disconnected");
                self.exit_listening();
            }
        }
    }

    /// Keep the continuous loop alive after a completed turn
    fn rearm_capture(&mut self) {
        if let Some(handle) = &self.channel {
            handle.send(ClientCommand::BeginCapture {
                device_index: self.device_index,
            });
        }
    }

    // ---- Periodic messages and greeting ----

    fn on_periodic_tick(&mut self) {
        if self.scheduler.is_paused() {
            debug!("Periodic message timer is paused");
            return;
        }
        debug!("Fetching periodic message");
        let gateway = self.gateway.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = gateway.fetch_periodic_message().await;
            let _ = events_tx.send(SessionEvent::PeriodicMessageReady { reply });
        });
    }

    fn on_periodic_message_ready(&mut self, reply: Result<String, GatewayError>) {
        match reply {
            // A fetch that was already in flight when the scheduler paused
            // still lands here; its entry appends normally.
            Ok(message) => self.append(Role::Assistant, message, Origin::Periodic),
            Err(e) => error!("Failed to fetch periodic message: {}", e),
        }
    }

    fn on_greeting_ready(&mut self, reply: Result<String, GatewayError>) {
        match reply {
            Ok(greeting) => self.append(Role::Assistant, greeting, Origin::Greeting),
            Err(e) => error!("Failed to fetch greeting: {}", e),
        }
    }

    // ---- Device selection ----

    fn on_select_device(&mut self, index: usize) {
        if self.mode == SessionMode::Listening {
            warn!("Device change ignored while listening; the open channel keeps its device");
            return;
        }
        if index >= self.devices.len() {
            warn!(
                "Device index {} out of range ({} devices)",
                index,
                self.devices.len()
            );
            return;
        }
        self.device_index = index;
        info!("Selected capture device {}: {}", index, self.devices[index].name);
    }
}

/// Escape characters with HTML significance before text reaches the backend
///
/// The transcript keeps the raw trimmed input; only the outbound copy is
/// escaped.
fn sanitize_text_input(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioCaptureError, AudioChunk};
    use crate::error::ChannelError;
    use crate::gateway::Settings;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::advance;

    const INTERVAL: Duration = Duration::from_secs(30);
    const RECORD_BOUND: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct FakeGateway {
        fail_submissions: AtomicBool,
        text_inputs: StdMutex<Vec<String>>,
        voice_calls: AtomicUsize,
        periodic_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Gateway for FakeGateway {
        async fn submit_message(
            &self,
            input: &str,
            _attachment: Option<&Attachment>,
        ) -> Result<String, GatewayError> {
            self.text_inputs.lock().unwrap().push(input.to_string());
            if self.fail_submissions.load(Ordering::SeqCst) {
                return Err(GatewayError::InvalidResponse("backend unavailable".into()));
            }
            Ok("hi there".to_string())
        }

        async fn submit_voice(&self, _wav: Vec<u8>) -> Result<VoiceReply, GatewayError> {
            self.voice_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_submissions.load(Ordering::SeqCst) {
                return Err(GatewayError::InvalidResponse("backend unavailable".into()));
            }
            Ok(VoiceReply {
                transcription: "hey".to_string(),
                ai_response: "hello!".to_string(),
            })
        }

        async fn fetch_greeting(&self) -> Result<String, GatewayError> {
            Ok("welcome".to_string())
        }

        async fn fetch_periodic_message(&self) -> Result<String, GatewayError> {
            self.periodic_calls.fetch_add(1, Ordering::SeqCst);
            Ok("still there?".to_string())
        }

        async fn fetch_settings(&self) -> Result<Settings, GatewayError> {
            Ok(Settings::default())
        }

        async fn update_settings(&self, _settings: &Settings) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        commands: Arc<StdMutex<Vec<ClientCommand>>>,
        fail_next: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChannelConnector for FakeConnector {
        async fn open(
            &self,
            _device_index: usize,
            _episode: u64,
            _events: mpsc::UnboundedSender<SessionEvent>,
        ) -> Result<ChannelHandle, ChannelError> {
            if self.fail_next.load(Ordering::SeqCst) {
                return Err(ChannelError::ConnectTimeout);
            }
            let (command_tx, mut command_rx) = mpsc::unbounded_channel();
            let commands = self.commands.clone();
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    commands.lock().unwrap().push(command);
                }
            });
            Ok(ChannelHandle::from_parts(
                command_tx,
                Arc::new(AtomicBool::new(true)),
                None,
            ))
        }
    }

    struct FakeCapture;

    impl CaptureBackend for FakeCapture {
        fn start(
            &self,
            _device_index: usize,
        ) -> Result<(AudioCaptureHandle, mpsc::Receiver<AudioChunk>), AudioCaptureError> {
            // The sender is dropped immediately: the collector sees an empty
            // capture and completes as soon as recording stops.
            let (_chunk_tx, chunk_rx) = mpsc::channel(1);
            Ok((
                AudioCaptureHandle {
                    is_capturing: Arc::new(AtomicBool::new(true)),
                    thread_handle: None,
                },
                chunk_rx,
            ))
        }
    }

    fn controller_with(
        gateway: Arc<FakeGateway>,
        connector: Arc<FakeConnector>,
    ) -> SessionController {
        SessionController::new(
            ControllerConfig {
                periodic_interval: INTERVAL,
                record_timeout: RECORD_BOUND,
            },
            gateway,
            connector,
            Arc::new(FakeCapture),
            vec![
                CaptureDevice {
                    name: "Built-in Microphone".to_string(),
                },
                CaptureDevice {
                    name: "USB Microphone".to_string(),
                },
            ],
        )
    }

    fn controller() -> (SessionController, Arc<FakeGateway>, Arc<FakeConnector>) {
        let gateway = Arc::new(FakeGateway::default());
        let connector = Arc::new(FakeConnector::default());
        (
            controller_with(gateway.clone(), connector.clone()),
            gateway,
            connector,
        )
    }

    /// Feed the next queued completion or timer event back into the loop
    async fn pump_one(ctl: &mut SessionController) {
        let event = ctl.events_rx.recv().await.expect("expected a queued event");
        ctl.dispatch(event).await;
    }

    /// Let spawned helper tasks (command drains, fetches) run
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn sent_commands(connector: &FakeConnector) -> Vec<ClientCommand> {
        connector.commands.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_submit_text_appends_user_then_assistant_and_settles_idle() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::SubmitText {
            input: "hello".to_string(),
        })
        .await;
        assert_eq!(ctl.mode, SessionMode::Processing);
        assert!(ctl.scheduler.is_paused());

        pump_one(&mut ctl).await;

        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, Role::User);
        assert_eq!(entries[0].content, "hello");
        assert_eq!(entries[0].origin, Origin::AdminText);
        assert_eq!(entries[1].role, Role::Assistant);
        assert_eq!(entries[1].content, "hi there");
        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(!ctl.scheduler.is_paused());
    }

    #[tokio::test]
    async fn test_empty_submission_without_attachment_is_ignored() {
        let (mut ctl, gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::SubmitText {
            input: "   ".to_string(),
        })
        .await;

        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(ctl.transcript.is_empty());
        assert!(gateway.text_inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attachment_allows_empty_text_and_is_cleared_after_submit() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::AttachFile {
            attachment: Attachment {
                filename: "cat.png".to_string(),
                content_type: "image/png".to_string(),
                bytes: vec![1, 2, 3],
            },
        })
        .await;
        ctl.dispatch(SessionEvent::SubmitText {
            input: "  ".to_string(),
        })
        .await;

        assert!(ctl.pending_upload.is_none());
        let entries = ctl.transcript.all();
        assert_eq!(entries[0].role, Role::System);
        assert_eq!(entries[0].content, "Image uploaded");
        assert_eq!(entries[0].origin, Origin::ImageUpload);
        assert_eq!(entries[1].role, Role::User);

        pump_one(&mut ctl).await;
        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(ctl.pending_upload.is_none());
    }

    #[tokio::test]
    async fn test_outbound_text_is_escaped_but_transcript_keeps_raw_input() {
        let (mut ctl, gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::SubmitText {
            input: "a <b> & 'c'".to_string(),
        })
        .await;
        pump_one(&mut ctl).await;

        assert_eq!(ctl.transcript.all()[0].content, "a <b> & 'c'");
        assert_eq!(
            gateway.text_inputs.lock().unwrap()[0],
            "a &lt;b&gt; &amp; &#x27;c&#x27;"
        );
    }

    #[tokio::test]
    async fn test_failed_submission_is_absorbed_and_settles_idle() {
        let (mut ctl, gateway, _connector) = controller();
        gateway.fail_submissions.store(true, Ordering::SeqCst);

        ctl.dispatch(SessionEvent::SubmitText {
            input: "hello".to_string(),
        })
        .await;
        pump_one(&mut ctl).await;

        // Only the optimistic user line; no error entry, nothing restored
        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].role, Role::User);
        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(!ctl.scheduler.is_paused());
    }

    #[tokio::test]
    async fn test_submission_blocked_while_processing() {
        let (mut ctl, gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::SubmitText {
            input: "first".to_string(),
        })
        .await;
        ctl.dispatch(SessionEvent::SubmitText {
            input: "second".to_string(),
        })
        .await;
        pump_one(&mut ctl).await;

        assert_eq!(gateway.text_inputs.lock().unwrap().len(), 1);
        // first user line + assistant reply only
        assert_eq!(ctl.transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_text_completion_is_discarded() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::TextExchangeDone {
            exchange: 99,
            reply: Ok("late reply".to_string()),
        })
        .await;

        assert!(ctl.transcript.is_empty());
        assert_eq!(ctl.mode, SessionMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattended_recording_is_force_stopped_exactly_once() {
        let (mut ctl, gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::ToggleRecording).await;
        assert_eq!(ctl.mode, SessionMode::Recording);
        assert!(ctl.scheduler.is_paused());
        settle().await;

        advance(RECORD_BOUND + Duration::from_millis(1)).await;
        pump_one(&mut ctl).await; // RecordTimeout
        assert_eq!(ctl.mode, SessionMode::Processing);

        pump_one(&mut ctl).await; // VoiceExchangeDone
        assert_eq!(gateway.voice_calls.load(Ordering::SeqCst), 1);

        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "hey");
        assert_eq!(entries[0].origin, Origin::VoiceRecording);
        assert_eq!(entries[1].content, "hello!");
        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(!ctl.scheduler.is_paused());

        // No second forced stop or voice call ever shows up
        advance(RECORD_BOUND * 2).await;
        settle().await;
        assert!(ctl.events_rx.try_recv().is_err());
        assert_eq!(gateway.voice_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_cancels_forced_stop() {
        let (mut ctl, gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::ToggleRecording).await;
        settle().await;
        advance(Duration::from_secs(2)).await;
        ctl.dispatch(SessionEvent::ToggleRecording).await;
        assert_eq!(ctl.mode, SessionMode::Processing);

        pump_one(&mut ctl).await; // VoiceExchangeDone
        assert_eq!(ctl.mode, SessionMode::Idle);
        assert_eq!(gateway.voice_calls.load(Ordering::SeqCst), 1);

        // The cancelled bound never fires
        advance(RECORD_BOUND * 2).await;
        settle().await;
        assert!(ctl.events_rx.try_recv().is_err());
        assert_eq!(gateway.voice_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recording_disabled_while_listening_and_vice_versa() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::ToggleListening).await;
        assert_eq!(ctl.mode, SessionMode::Listening);
        ctl.dispatch(SessionEvent::ToggleRecording).await;
        assert_eq!(ctl.mode, SessionMode::Listening);
        assert!(ctl.recording.is_none());

        ctl.dispatch(SessionEvent::ToggleListening).await;
        assert_eq!(ctl.mode, SessionMode::Idle);

        ctl.dispatch(SessionEvent::ToggleRecording).await;
        assert_eq!(ctl.mode, SessionMode::Recording);
        ctl.dispatch(SessionEvent::ToggleListening).await;
        assert_eq!(ctl.mode, SessionMode::Recording);
        assert!(ctl.channel.is_none());
    }

    #[tokio::test]
    async fn test_listening_turn_appends_entries_and_rearms_capture() {
        let (mut ctl, _gateway, connector) = controller();

        ctl.dispatch(SessionEvent::SelectDevice { index: 0 }).await;
        ctl.dispatch(SessionEvent::ToggleListening).await;
        settle().await;

        assert_eq!(ctl.mode, SessionMode::Listening);
        assert!(ctl.scheduler.is_paused());
        assert_eq!(
            sent_commands(&connector),
            vec![ClientCommand::BeginCapture { device_index: 0 }]
        );

        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Event(ServerEvent::Result {
                transcription: "hey".to_string(),
                ai_response: "hello!".to_string(),
            }),
        })
        .await;
        settle().await;

        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "hey");
        assert_eq!(entries[0].origin, Origin::LiveListening);
        assert_eq!(entries[1].content, "hello!");
        assert_eq!(
            sent_commands(&connector),
            vec![
                ClientCommand::BeginCapture { device_index: 0 },
                ClientCommand::BeginCapture { device_index: 0 },
            ]
        );
        assert_eq!(ctl.mode, SessionMode::Listening);
    }

    #[tokio::test]
    async fn test_server_periodic_message_appends_and_rearms() {
        let (mut ctl, _gateway, connector) = controller();

        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Event(ServerEvent::PeriodicMessage {
                message: "you went quiet".to_string(),
            }),
        })
        .await;
        settle().await;

        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin, Origin::Periodic);
        assert_eq!(sent_commands(&connector).len(), 2);
        assert_eq!(ctl.mode, SessionMode::Listening);
    }

    #[tokio::test]
    async fn test_quit_event_appends_final_turn_and_exits() {
        let (mut ctl, _gateway, connector) = controller();

        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Event(ServerEvent::Quit {
                transcription: "goodbye".to_string(),
                ai_response: "see you".to_string(),
            }),
        })
        .await;
        settle().await;

        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(ctl.channel.is_none());
        assert!(!ctl.scheduler.is_paused());
        assert_eq!(ctl.transcript.len(), 2);

        let commands = sent_commands(&connector);
        assert_eq!(commands.last(), Some(&ClientCommand::EndCapture));
        // No re-arm after the exit
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, ClientCommand::BeginCapture { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_deactivated_appends_farewell_and_exits() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Event(ServerEvent::Deactivated {
                ai_response: "talk later".to_string(),
            }),
        })
        .await;

        assert_eq!(ctl.mode, SessionMode::Idle);
        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].role, Role::Assistant);
        assert_eq!(entries[0].content, "talk later");
    }

    #[tokio::test]
    async fn test_channel_error_exits_without_transcript_entry() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Event(ServerEvent::Error {
                message: "mic exploded".to_string(),
            }),
        })
        .await;

        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(ctl.transcript.is_empty());
        assert!(!ctl.scheduler.is_paused());
    }

    #[tokio::test]
    async fn test_transport_disconnect_exits_listening() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Disconnected,
        })
        .await;

        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(ctl.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_stale_episode_events_are_discarded() {
        let (mut ctl, _gateway, _connector) = controller();

        // Episode 1 opens and closes
        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::ToggleListening).await;
        // Episode 2 is live
        ctl.dispatch(SessionEvent::ToggleListening).await;
        assert_eq!(ctl.mode, SessionMode::Listening);

        ctl.dispatch(SessionEvent::Channel {
            episode: 1,
            event: ChannelEvent::Event(ServerEvent::Result {
                transcription: "ghost".to_string(),
                ai_response: "from the past".to_string(),
            }),
        })
        .await;

        assert!(ctl.transcript.is_empty());
        assert_eq!(ctl.mode, SessionMode::Listening);
    }

    #[tokio::test]
    async fn test_channel_open_failure_settles_back_to_idle() {
        let (mut ctl, _gateway, connector) = controller();
        connector.fail_next.store(true, Ordering::SeqCst);

        ctl.dispatch(SessionEvent::ToggleListening).await;

        assert_eq!(ctl.mode, SessionMode::Idle);
        assert!(ctl.channel.is_none());
        assert!(!ctl.scheduler.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_never_fires_while_listening() {
        let (mut ctl, gateway, _connector) = controller();
        ctl.start();
        pump_one(&mut ctl).await; // greeting

        ctl.dispatch(SessionEvent::ToggleListening).await;
        assert!(ctl.scheduler.is_paused());

        advance(INTERVAL * 5).await;
        settle().await;

        assert!(ctl.events_rx.try_recv().is_err());
        assert_eq!(gateway.periodic_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_message_fetched_and_appended_when_idle() {
        let (mut ctl, gateway, _connector) = controller();
        ctl.start();
        pump_one(&mut ctl).await; // greeting
        settle().await;

        advance(INTERVAL + Duration::from_millis(1)).await;
        pump_one(&mut ctl).await; // PeriodicTick
        pump_one(&mut ctl).await; // PeriodicMessageReady

        assert_eq!(gateway.periodic_calls.load(Ordering::SeqCst), 1);
        let entries = ctl.transcript.all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].origin, Origin::Greeting);
        assert_eq!(entries[1].origin, Origin::Periodic);
        assert_eq!(entries[1].content, "still there?");
    }

    #[tokio::test]
    async fn test_in_flight_periodic_fetch_still_appends_after_listening_begins() {
        let (mut ctl, _gateway, _connector) = controller();

        // A firing already in flight when listening begins
        ctl.dispatch(SessionEvent::PeriodicTick).await;
        ctl.dispatch(SessionEvent::ToggleListening).await;

        pump_one(&mut ctl).await; // PeriodicMessageReady

        assert_eq!(ctl.mode, SessionMode::Listening);
        assert_eq!(ctl.transcript.len(), 1);
        assert_eq!(ctl.transcript.all()[0].origin, Origin::Periodic);
    }

    #[tokio::test]
    async fn test_greeting_failure_leaves_session_usable() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::GreetingReady {
            reply: Err(GatewayError::InvalidResponse("no greeting".into())),
        })
        .await;
        assert!(ctl.transcript.is_empty());

        ctl.dispatch(SessionEvent::SubmitText {
            input: "hello".to_string(),
        })
        .await;
        pump_one(&mut ctl).await;
        assert_eq!(ctl.transcript.len(), 2);
        assert_eq!(ctl.mode, SessionMode::Idle);
    }

    #[tokio::test]
    async fn test_device_selection_is_validated() {
        let (mut ctl, _gateway, _connector) = controller();

        ctl.dispatch(SessionEvent::SelectDevice { index: 5 }).await;
        assert_eq!(ctl.device_index, DEFAULT_DEVICE_INDEX);

        ctl.dispatch(SessionEvent::SelectDevice { index: 0 }).await;
        assert_eq!(ctl.device_index, 0);

        // Locked for the duration of an episode
        ctl.dispatch(SessionEvent::ToggleListening).await;
        ctl.dispatch(SessionEvent::SelectDevice { index: 1 }).await;
        assert_eq!(ctl.device_index, 0);
    }

    #[test]
    fn test_sanitize_text_input_escapes_html() {
        assert_eq!(
            sanitize_text_input(r#"<img src="x"/>"#),
            "&lt;img src&#x3D;&quot;x&quot;&#x2F;&gt;"
        );
        assert_eq!(sanitize_text_input("plain text"), "plain text");
    }
}
