//! Per-renderer playback engine.
//!
//! Three independent sources mutate a [`Device`]: the command dispatcher, the
//! poll timer and inbound subscription events. Each state group has its own
//! lock and a freshness stamp drawn from one per-device sequence. A stamp is
//! taken when a poll request is issued or an event arrives, and an update is
//! applied only if its stamp is newer than the one recorded for the group, so
//! a slow poll answer never overwrites what a later event reported.

use crate::bus::EventBus;
use crate::dlna::events::{didl_title, format_duration, parse_duration, parse_event};
use crate::dlna::transport::{DeviceTransport, SoapResponse};
use crate::dlna::types::{
    AvTransportRequest, CommandKind, DeviceCommand, DeviceEvent, DeviceProperties, MediaInfo,
    ServiceEndpoint, TransportState,
};
use crate::error::TransportError;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const VOLUME_STEP: u32 = 5;

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Where the renderer should deliver events. Empty disables subscriptions.
    pub callback_url: String,
    /// Steady-state delay between polls.
    pub poll_interval: Duration,
    /// Delay before the poll that follows a command.
    pub immediate_refresh: Duration,
    /// Minimum age of a fact before it is fetched again.
    pub refresh_throttle: Duration,
    pub subscription_timeout: Duration,
    /// Consecutive failed polls before the device is declared unavailable.
    pub failure_threshold: u32,
    /// Dispatcher sleep when the command queue is empty.
    pub dispatch_idle: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            callback_url: String::new(),
            poll_interval: Duration::from_secs(1),
            immediate_refresh: Duration::from_millis(100),
            refresh_throttle: Duration::from_secs(5),
            subscription_timeout: Duration::from_secs(1800),
            failure_threshold: 3,
            dispatch_idle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Poll shortly, refreshing every fact regardless of age.
    Now,
    Normal,
    /// Disarmed until a command or event reactivates it.
    Never,
}

#[derive(Debug, Clone, Default)]
struct Stamped<T> {
    value: T,
    stamp: u64,
}

impl<T> Stamped<T> {
    fn accept(&mut self, stamp: u64) -> bool {
        if stamp <= self.stamp {
            return false;
        }
        self.stamp = stamp;
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct VolumeState {
    /// Native device units.
    volume: Option<u32>,
    muted: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PositionState {
    position: Option<Duration>,
    duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
enum Fact {
    Transport = 0,
    Position = 1,
    Media = 2,
    Volume = 3,
}

#[derive(Default)]
struct RefreshTimes {
    last: [Option<Instant>; 4],
    force: bool,
}

struct TimerControl {
    mode: TimerMode,
    generation: u64,
}

struct ActiveSubscription {
    sid: String,
    renew_at: Instant,
}

#[derive(Default)]
struct Subscriptions {
    av_transport: Option<ActiveSubscription>,
    rendering_control: Option<ActiveSubscription>,
}

/// One remote renderer. Cloning shares the same engine.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    props: DeviceProperties,
    transport: Arc<dyn DeviceTransport>,
    bus: EventBus,
    settings: DeviceSettings,
    queue: Mutex<VecDeque<DeviceCommand>>,
    transport_state: Mutex<Stamped<Option<TransportState>>>,
    volume: Mutex<Stamped<VolumeState>>,
    position: Mutex<Stamped<PositionState>>,
    media: Mutex<Stamped<Option<MediaInfo>>>,
    refreshed: Mutex<RefreshTimes>,
    timer: Mutex<TimerControl>,
    timer_notify: Notify,
    subscriptions: tokio::sync::Mutex<Subscriptions>,
    sids: RwLock<Vec<String>>,
    sequence: AtomicU64,
    failures: AtomicU32,
    started: AtomicBool,
    disposed: CancellationToken,
}

impl Device {
    pub fn new(
        props: DeviceProperties,
        transport: Arc<dyn DeviceTransport>,
        bus: EventBus,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                props,
                transport,
                bus,
                settings,
                queue: Mutex::new(VecDeque::new()),
                transport_state: Mutex::new(Stamped::default()),
                volume: Mutex::new(Stamped::default()),
                position: Mutex::new(Stamped::default()),
                media: Mutex::new(Stamped::default()),
                refreshed: Mutex::new(RefreshTimes::default()),
                timer: Mutex::new(TimerControl {
                    mode: TimerMode::Now,
                    generation: 0,
                }),
                timer_notify: Notify::new(),
                subscriptions: tokio::sync::Mutex::new(Subscriptions::default()),
                sids: RwLock::new(Vec::new()),
                sequence: AtomicU64::new(0),
                failures: AtomicU32::new(0),
                started: AtomicBool::new(false),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the command dispatcher and the poll timer. The first poll also
    /// subscribes to both event feeds.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting device {} ({})", self.name(), self.inner.props.base_url);
        tokio::spawn(self.clone().run_dispatcher());
        tokio::spawn(self.clone().run_timer());
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.props
    }

    pub fn name(&self) -> &str {
        &self.inner.props.name
    }

    pub fn uuid(&self) -> &str {
        &self.inner.props.uuid
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    pub fn transport_state(&self) -> Option<TransportState> {
        self.inner.transport_state.lock().value
    }

    pub fn is_playing(&self) -> bool {
        self.transport_state() == Some(TransportState::Playing)
    }

    pub fn is_paused(&self) -> bool {
        self.transport_state().is_some_and(|s| s.is_paused())
    }

    pub fn is_stopped(&self) -> bool {
        self.transport_state() == Some(TransportState::Stopped)
    }

    /// Volume normalized to 0-100.
    pub fn volume(&self) -> Option<u32> {
        self.inner
            .volume
            .lock()
            .value
            .volume
            .map(|v| self.inner.props.normalize_volume(v))
    }

    pub fn is_muted(&self) -> Option<bool> {
        self.inner.volume.lock().value.muted
    }

    pub fn position(&self) -> Option<Duration> {
        self.inner.position.lock().value.position
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.position.lock().value.duration
    }

    pub fn current_media(&self) -> Option<MediaInfo> {
        self.inner.media.lock().value.clone()
    }

    pub fn pending_commands(&self) -> Vec<DeviceCommand> {
        self.inner.queue.lock().iter().cloned().collect()
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.inner.sids.read().clone()
    }

    pub fn owns_subscription(&self, sid: &str) -> bool {
        self.inner.sids.read().iter().any(|s| s == sid)
    }

    pub(crate) fn timer_mode(&self) -> TimerMode {
        self.inner.timer.lock().mode
    }

    // Commands. All of them enqueue and return.

    pub fn play(&self) {
        self.enqueue(DeviceCommand::Play);
    }

    pub fn pause(&self) {
        self.enqueue(DeviceCommand::Pause);
    }

    pub fn stop(&self) {
        self.enqueue(DeviceCommand::Stop);
    }

    pub fn mute(&self) {
        self.enqueue(DeviceCommand::SetMute(true));
    }

    pub fn unmute(&self) {
        self.enqueue(DeviceCommand::SetMute(false));
    }

    /// Flips the most recent intent: a pending mute change if there is one,
    /// otherwise the last known device state.
    pub fn toggle_mute(&self) {
        let pending = self.inner.queue.lock().iter().find_map(|c| match c {
            DeviceCommand::SetMute(muted) => Some(*muted),
            _ => None,
        });
        let muted = pending.or_else(|| self.is_muted()).unwrap_or(false);
        self.enqueue(DeviceCommand::SetMute(!muted));
    }

    pub fn set_volume(&self, volume: u32) {
        self.enqueue(DeviceCommand::SetVolume(volume.min(100)));
    }

    pub fn volume_up(&self) {
        let current = self.intended_volume();
        self.set_volume(current.saturating_add(VOLUME_STEP));
    }

    pub fn volume_down(&self) {
        let current = self.intended_volume();
        self.set_volume(current.saturating_sub(VOLUME_STEP));
    }

    fn intended_volume(&self) -> u32 {
        let pending = self.inner.queue.lock().iter().find_map(|c| match c {
            DeviceCommand::SetVolume(v) => Some(*v),
            _ => None,
        });
        pending.or_else(|| self.volume()).unwrap_or(0)
    }

    pub fn seek(&self, position: Duration) {
        self.enqueue(DeviceCommand::Seek(position));
    }

    pub fn set_av_transport(
        &self,
        url: impl Into<String>,
        headers: HashMap<String, String>,
        metadata: impl Into<String>,
        play_immediately: bool,
    ) {
        self.enqueue(DeviceCommand::SetAvTransport(AvTransportRequest {
            url: url.into(),
            headers,
            metadata: metadata.into(),
            play_immediately,
        }));
    }

    /// A pending command of the same kind is replaced in place. Transport
    /// intents are the exception: the newest one supersedes the pending one
    /// and moves to the back, so it runs after everything queued before it.
    fn enqueue(&self, command: DeviceCommand) {
        if self.is_disposed() {
            debug!("{}: dropping {:?}, device disposed", self.name(), command);
            return;
        }
        let mut queue = self.inner.queue.lock();
        let kind = command.kind();
        let pending = queue.iter().position(|c| c.kind() == kind);
        match pending {
            Some(i) if kind == CommandKind::Transport && queue[i] != command => {
                queue.remove(i);
                queue.push_back(command);
            }
            Some(i) => queue[i] = command,
            None => queue.push_back(command),
        }
    }

    async fn run_dispatcher(self) {
        let disposed = self.inner.disposed.clone();
        loop {
            let next = self.inner.queue.lock().pop_front();
            match next {
                Some(command) => {
                    tokio::select! {
                        _ = disposed.cancelled() => break,
                        _ = self.dispatch(command) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = disposed.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.settings.dispatch_idle) => {}
                    }
                }
            }
        }
        debug!("{}: dispatcher stopped", self.name());
    }

    /// One protocol round trip for one queued command.
    async fn dispatch(&self, command: DeviceCommand) {
        self.ensure_subscribed().await;

        let props = &self.inner.props;
        let result = match &command {
            DeviceCommand::Play => self
                .call(&props.av_transport, "Play", &[instance(), ("Speed", "1".into())])
                .await
                .map(drop),
            DeviceCommand::Pause => self
                .call(&props.av_transport, "Pause", &[instance()])
                .await
                .map(drop),
            DeviceCommand::Stop => self
                .call(&props.av_transport, "Stop", &[instance()])
                .await
                .map(drop),
            DeviceCommand::SetVolume(volume) => {
                let native = props.native_volume(*volume);
                let sent = self
                    .call(
                        &props.rendering_control,
                        "SetVolume",
                        &[instance(), master(), ("DesiredVolume", native.to_string())],
                    )
                    .await;
                sent.map(|_| {
                    self.apply_volume(Some(native), None, self.next_stamp());
                })
            }
            DeviceCommand::SetMute(muted) => {
                let desired = if *muted { "1" } else { "0" };
                let sent = self
                    .call(
                        &props.rendering_control,
                        "SetMute",
                        &[instance(), master(), ("DesiredMute", desired.into())],
                    )
                    .await;
                sent.map(|_| {
                    self.apply_volume(None, Some(*muted), self.next_stamp());
                })
            }
            DeviceCommand::Seek(position) => self
                .call(
                    &props.av_transport,
                    "Seek",
                    &[
                        instance(),
                        ("Unit", "REL_TIME".into()),
                        ("Target", format_duration(*position)),
                    ],
                )
                .await
                .map(drop),
            DeviceCommand::SetAvTransport(request) => {
                let sent = self
                    .inner
                    .transport
                    .send_command(
                        &props.av_transport,
                        "SetAVTransportURI",
                        &[
                            instance(),
                            ("CurrentURI", request.url.clone()),
                            ("CurrentURIMetaData", request.metadata.clone()),
                        ],
                        &request.headers,
                    )
                    .await;
                sent.map(|_| {
                    if request.play_immediately {
                        self.play();
                    }
                })
            }
        };

        match result {
            Ok(()) => {
                debug!("{}: {:?} sent", self.name(), command.kind());
                self.restart_timer(TimerMode::Now);
            }
            Err(e) => warn!("{}: {:?} failed: {}", self.name(), command.kind(), e),
        }
    }

    async fn call(
        &self,
        service: &ServiceEndpoint,
        action: &str,
        args: &[(&str, String)],
    ) -> Result<SoapResponse, TransportError> {
        self.inner
            .transport
            .send_command(service, action, args, &HashMap::new())
            .await
    }

    /// Subscribes to both event feeds, renewing at half the granted timeout.
    /// Failures are logged; polling carries the state meanwhile.
    async fn ensure_subscribed(&self) {
        let callback = &self.inner.settings.callback_url;
        if callback.is_empty() || self.is_disposed() {
            return;
        }

        let mut guard = self.inner.subscriptions.lock().await;
        let subs = &mut *guard;
        let props = &self.inner.props;
        for (slot, endpoint) in [
            (&mut subs.av_transport, &props.av_transport),
            (&mut subs.rendering_control, &props.rendering_control),
        ] {
            let due = slot.as_ref().map_or(true, |s| Instant::now() >= s.renew_at);
            if !due {
                continue;
            }

            let previous = slot.take().map(|s| s.sid);
            let timeout = self.inner.settings.subscription_timeout;
            let result = match self
                .inner
                .transport
                .subscribe(endpoint, callback, previous.as_deref(), timeout)
                .await
            {
                Err(e) if previous.is_some() => {
                    debug!("{}: renewal failed ({}), resubscribing", self.name(), e);
                    self.inner
                        .transport
                        .subscribe(endpoint, callback, None, timeout)
                        .await
                }
                other => other,
            };

            let mut sids = self.inner.sids.write();
            if let Some(old) = &previous {
                sids.retain(|s| s != old);
            }
            match result {
                Ok(sub) => {
                    debug!(
                        "{}: subscribed to {} as {} for {:?}",
                        self.name(),
                        endpoint.service_type,
                        sub.sid,
                        sub.timeout
                    );
                    sids.push(sub.sid.clone());
                    *slot = Some(ActiveSubscription {
                        sid: sub.sid,
                        renew_at: Instant::now() + sub.timeout / 2,
                    });
                }
                Err(e) => warn!(
                    "{}: subscribe to {} failed: {}",
                    self.name(),
                    endpoint.service_type,
                    e
                ),
            }
        }
    }

    fn restart_timer(&self, mode: TimerMode) {
        {
            let mut timer = self.inner.timer.lock();
            timer.mode = mode;
            timer.generation += 1;
        }
        if mode == TimerMode::Now {
            self.inner.refreshed.lock().force = true;
        }
        self.inner.timer_notify.notify_one();
    }

    async fn run_timer(self) {
        let disposed = self.inner.disposed.clone();
        loop {
            let (mode, generation) = {
                let timer = self.inner.timer.lock();
                (timer.mode, timer.generation)
            };
            let delay = match mode {
                TimerMode::Now => Some(self.inner.settings.immediate_refresh),
                TimerMode::Normal => Some(self.inner.settings.poll_interval),
                TimerMode::Never => None,
            };

            tokio::select! {
                _ = disposed.cancelled() => break,
                _ = self.inner.timer_notify.notified() => continue,
                _ = sleep_or_forever(delay) => {}
            }

            let outcome = tokio::select! {
                _ = disposed.cancelled() => break,
                outcome = self.refresh() => outcome,
            };

            let next = match outcome {
                Ok(Some(TransportState::Stopped)) => {
                    self.inner.failures.store(0, Ordering::SeqCst);
                    TimerMode::Never
                }
                Ok(_) => {
                    self.inner.failures.store(0, Ordering::SeqCst);
                    TimerMode::Normal
                }
                Err(e) => {
                    let failures = self.inner.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!("{}: poll failed ({} in a row): {}", self.name(), failures, e);
                    if failures >= self.inner.settings.failure_threshold {
                        info!("Device {} is unavailable", self.name());
                        self.inner.bus.publish(DeviceEvent::Unavailable {
                            device: self.uuid().to_string(),
                        });
                        self.dispose().await;
                        break;
                    }
                    TimerMode::Normal
                }
            };

            let mut timer = self.inner.timer.lock();
            // A command or event re-armed the timer while the poll ran.
            if timer.generation == generation {
                timer.mode = next;
            }
        }
        debug!("{}: poll timer stopped", self.name());
    }

    fn is_due(&self, fact: Fact, force: bool) -> bool {
        force
            || self.inner.refreshed.lock().last[fact as usize]
                .map_or(true, |at| at.elapsed() >= self.inner.settings.refresh_throttle)
    }

    fn mark_refreshed(&self, fact: Fact) {
        self.inner.refreshed.lock().last[fact as usize] = Some(Instant::now());
    }

    fn next_stamp(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// One poll pass. Returns the transport state known afterwards.
    async fn refresh(&self) -> Result<Option<TransportState>, TransportError> {
        self.ensure_subscribed().await;
        let force = std::mem::take(&mut self.inner.refreshed.lock().force);
        let props = &self.inner.props;

        if self.is_due(Fact::Transport, force) {
            let stamp = self.next_stamp();
            let resp = self
                .call(&props.av_transport, "GetTransportInfo", &[instance()])
                .await?;
            match resp
                .get("CurrentTransportState")
                .map(str::parse::<TransportState>)
            {
                Some(Ok(state)) => {
                    self.apply_transport_state(state, stamp);
                }
                Some(Err(e)) => debug!("{}: {}", self.name(), e),
                None => {}
            }
            self.mark_refreshed(Fact::Transport);
        }

        if self.transport_state() != Some(TransportState::Stopped) {
            if self.is_due(Fact::Position, force) {
                let stamp = self.next_stamp();
                let resp = self
                    .call(&props.av_transport, "GetPositionInfo", &[instance()])
                    .await?;
                self.apply_position(
                    resp.get("RelTime").and_then(parse_duration),
                    resp.get("TrackDuration").and_then(parse_duration),
                    stamp,
                );
                self.mark_refreshed(Fact::Position);
                if let Some(track) = media_from(resp.get("TrackURI"), resp.get("TrackMetaData")) {
                    self.update_media(Some(track), stamp);
                    self.mark_refreshed(Fact::Media);
                }
            }

            if self.is_due(Fact::Media, force) {
                let stamp = self.next_stamp();
                let resp = self
                    .call(&props.av_transport, "GetMediaInfo", &[instance()])
                    .await?;
                if let Some(media) = media_from(resp.get("CurrentURI"), resp.get("CurrentURIMetaData")) {
                    self.update_media(Some(media), stamp);
                }
                self.mark_refreshed(Fact::Media);
            }
        }

        if self.is_due(Fact::Volume, force) {
            let stamp = self.next_stamp();
            let volume = self
                .call(&props.rendering_control, "GetVolume", &[instance(), master()])
                .await?;
            let mute = self
                .call(&props.rendering_control, "GetMute", &[instance(), master()])
                .await?;
            self.apply_volume(
                volume.get("CurrentVolume").and_then(|v| v.trim().parse().ok()),
                mute.get("CurrentMute").map(|v| matches!(v.trim(), "1" | "true")),
                stamp,
            );
            self.mark_refreshed(Fact::Volume);
        }

        Ok(self.transport_state())
    }

    /// Applies a decoded subscription event. Returns false when `sid` does not
    /// belong to this device.
    pub fn on_event(&self, sid: &str, body: &str) -> bool {
        if self.is_disposed() || !self.owns_subscription(sid) {
            return false;
        }
        let stamp = self.next_stamp();
        let update = parse_event(body);
        if update.is_empty() {
            return true;
        }

        // Transport state goes first so media changes are classified against
        // it. STOPPED clears the media, so a URI in the same event is stale.
        let stopped = update.transport_state == Some(TransportState::Stopped);
        if let Some(state) = update.transport_state {
            self.apply_transport_state(state, stamp);
            self.mark_refreshed(Fact::Transport);
        }
        if update.position.is_some() || update.duration.is_some() {
            self.apply_position(update.position, update.duration, stamp);
            self.mark_refreshed(Fact::Position);
        }
        if !stopped {
            if let Some(media) = media_from(update.uri.as_deref(), update.metadata.as_deref()) {
                self.update_media(Some(media), stamp);
                self.mark_refreshed(Fact::Media);
            }
        }
        if update.volume.is_some() || update.mute.is_some() {
            self.apply_volume(update.volume, update.mute, stamp);
            self.mark_refreshed(Fact::Volume);
        }
        if stopped {
            self.restart_timer(TimerMode::Never);
        } else if update.transport_state.is_some() && self.timer_mode() == TimerMode::Never {
            self.restart_timer(TimerMode::Normal);
        }
        true
    }

    fn apply_transport_state(&self, state: TransportState, stamp: u64) -> bool {
        {
            let mut current = self.inner.transport_state.lock();
            if !current.accept(stamp) {
                debug!("{}: ignoring stale transport state {}", self.name(), state);
                return false;
            }
            current.value = Some(state);
        }
        if state == TransportState::Stopped {
            self.update_media(None, stamp);
        }
        true
    }

    fn apply_volume(&self, volume: Option<u32>, muted: Option<bool>, stamp: u64) -> bool {
        let mut current = self.inner.volume.lock();
        if !current.accept(stamp) {
            return false;
        }
        if volume.is_some() {
            current.value.volume = volume;
        }
        if muted.is_some() {
            current.value.muted = muted;
        }
        true
    }

    fn apply_position(&self, position: Option<Duration>, duration: Option<Duration>, stamp: u64) -> bool {
        let mut current = self.inner.position.lock();
        if !current.accept(stamp) {
            return false;
        }
        if position.is_some() {
            current.value.position = position;
        }
        if duration.is_some() {
            current.value.duration = duration;
        }
        true
    }

    fn update_media(&self, media: Option<MediaInfo>, stamp: u64) {
        let old = {
            let mut current = self.inner.media.lock();
            if !current.accept(stamp) {
                return;
            }
            std::mem::replace(&mut current.value, media.clone())
        };
        let event = classify_media_change(
            self.uuid(),
            old,
            media,
            self.transport_state(),
            self.position(),
        );
        if let Some(event) = event {
            self.inner.bus.publish(event);
        }
    }

    /// Stops the dispatcher and the timer and drops both subscriptions.
    /// Later commands are ignored.
    pub async fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        self.inner.disposed.cancel();
        self.inner.queue.lock().clear();

        let (av, rc) = {
            let mut subs = self.inner.subscriptions.lock().await;
            (subs.av_transport.take(), subs.rendering_control.take())
        };
        let props = &self.inner.props;
        for (sub, endpoint) in [(av, &props.av_transport), (rc, &props.rendering_control)] {
            let Some(sub) = sub else { continue };
            if let Err(e) = self.inner.transport.unsubscribe(endpoint, &sub.sid).await {
                warn!("{}: unsubscribe {} failed: {}", self.name(), sub.sid, e);
            }
        }
        self.inner.sids.write().clear();
        info!("Disposed device {}", self.name());
    }
}

fn instance() -> (&'static str, String) {
    ("InstanceID", "0".to_string())
}

fn master() -> (&'static str, String) {
    ("Channel", "Master".to_string())
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

fn media_from(uri: Option<&str>, metadata: Option<&str>) -> Option<MediaInfo> {
    let usable = |s: &&str| !s.is_empty() && *s != "NOT_IMPLEMENTED";
    let uri = uri.map(str::trim).filter(usable)?;
    let metadata = metadata.map(str::trim).filter(usable).map(str::to_string);
    Some(MediaInfo {
        uri: uri.to_string(),
        title: metadata.as_deref().and_then(didl_title),
        metadata,
    })
}

/// Maps a media transition to at most one notification.
pub fn classify_media_change(
    device: &str,
    old: Option<MediaInfo>,
    new: Option<MediaInfo>,
    state: Option<TransportState>,
    position: Option<Duration>,
) -> Option<DeviceEvent> {
    let device = device.to_string();
    match (old, new) {
        (None, None) => None,
        (Some(media), None) => Some(DeviceEvent::PlaybackStopped { device, media }),
        (None, Some(media)) => {
            if state == Some(TransportState::Stopped) {
                None
            } else {
                Some(DeviceEvent::PlaybackStart { device, media })
            }
        }
        (Some(old), Some(new)) if old == new => Some(DeviceEvent::PlaybackProgress {
            device,
            media: new,
            position,
        }),
        (Some(old), Some(new)) => Some(DeviceEvent::MediaChanged { device, old, new }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::Event;
    use crate::dlna::transport::Subscription;
    use crate::dlna::types::{AV_TRANSPORT, RENDERING_CONTROL};
    use async_trait::async_trait;

    #[derive(Debug, Clone)]
    pub(crate) struct FakeCall {
        pub action: String,
        pub args: Vec<(String, String)>,
        pub headers: HashMap<String, String>,
    }

    /// Scripted in-memory renderer. `None` replies fail with a timeout.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        calls: Mutex<Vec<FakeCall>>,
        scripted: Mutex<HashMap<String, VecDeque<Option<SoapResponse>>>>,
        defaults: Mutex<HashMap<String, Option<SoapResponse>>>,
        delays: Mutex<HashMap<String, Duration>>,
        pub unsubscribed: Mutex<Vec<String>>,
        /// `(event path, renewed sid)` per SUBSCRIBE.
        pub subscribes: Mutex<Vec<(String, Option<String>)>>,
        granted: Mutex<Option<Duration>>,
        fail_renewals: AtomicBool,
        issued: AtomicU32,
    }

    impl FakeTransport {
        pub(crate) fn respond(&self, action: &str, pairs: &[(&str, &str)]) {
            self.defaults.lock().insert(
                action.to_string(),
                Some(SoapResponse::from_pairs(pairs.iter().copied())),
            );
        }

        pub(crate) fn fail(&self, action: &str) {
            self.defaults.lock().insert(action.to_string(), None);
        }

        pub(crate) fn script(&self, action: &str, replies: Vec<Option<SoapResponse>>) {
            self.scripted
                .lock()
                .insert(action.to_string(), replies.into_iter().collect());
        }

        pub(crate) fn delay(&self, action: &str, delay: Duration) {
            self.delays.lock().insert(action.to_string(), delay);
        }

        /// Grants `timeout` instead of the requested one.
        pub(crate) fn grant(&self, timeout: Duration) {
            *self.granted.lock() = Some(timeout);
        }

        pub(crate) fn fail_renewals(&self) {
            self.fail_renewals.store(true, Ordering::SeqCst);
        }

        pub(crate) fn calls(&self, action: &str) -> Vec<FakeCall> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.action == action)
                .cloned()
                .collect()
        }

        pub(crate) fn actions(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.action.clone()).collect()
        }
    }

    #[async_trait]
    impl DeviceTransport for FakeTransport {
        async fn send_command(
            &self,
            _service: &ServiceEndpoint,
            action: &str,
            args: &[(&str, String)],
            extra_headers: &HashMap<String, String>,
        ) -> Result<SoapResponse, TransportError> {
            self.calls.lock().push(FakeCall {
                action: action.to_string(),
                args: args.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                headers: extra_headers.clone(),
            });
            let delay = self.delays.lock().get(action).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self
                .scripted
                .lock()
                .get_mut(action)
                .and_then(|replies| replies.pop_front());
            let reply = scripted.unwrap_or_else(|| {
                self.defaults
                    .lock()
                    .get(action)
                    .cloned()
                    .unwrap_or_else(|| Some(SoapResponse::default()))
            });
            reply.ok_or(TransportError::Timeout)
        }

        async fn subscribe(
            &self,
            service: &ServiceEndpoint,
            _callback_url: &str,
            renew_sid: Option<&str>,
            timeout: Duration,
        ) -> Result<Subscription, TransportError> {
            self.subscribes
                .lock()
                .push((service.event_sub_url.clone(), renew_sid.map(str::to_string)));
            if renew_sid.is_some() && self.fail_renewals.load(Ordering::SeqCst) {
                return Err(TransportError::Status(412));
            }
            let sid = match renew_sid {
                Some(sid) => sid.to_string(),
                None => format!(
                    "uuid:sub{}-{}",
                    service.event_sub_url.replace('/', "-"),
                    self.issued.fetch_add(1, Ordering::SeqCst)
                ),
            };
            let timeout = self.granted.lock().unwrap_or(timeout);
            Ok(Subscription { sid, timeout })
        }

        async fn unsubscribe(
            &self,
            _service: &ServiceEndpoint,
            sid: &str,
        ) -> Result<(), TransportError> {
            self.unsubscribed.lock().push(sid.to_string());
            Ok(())
        }
    }

    pub(crate) fn props(uuid: &str) -> DeviceProperties {
        DeviceProperties {
            uuid: uuid.to_string(),
            name: format!("Renderer {uuid}"),
            base_url: "http://10.0.0.9:49152".to_string(),
            av_transport: ServiceEndpoint {
                service_type: AV_TRANSPORT.to_string(),
                control_url: "/avt/ctl".to_string(),
                event_sub_url: "/avt/evt".to_string(),
            },
            rendering_control: ServiceEndpoint {
                service_type: RENDERING_CONTROL.to_string(),
                control_url: "/rc/ctl".to_string(),
                event_sub_url: "/rc/evt".to_string(),
            },
            volume_min: 0,
            volume_max: 100,
        }
    }

    pub(crate) fn fast_settings() -> DeviceSettings {
        DeviceSettings {
            callback_url: "http://10.0.0.1:8096/dlna/events".to_string(),
            poll_interval: Duration::from_millis(10),
            immediate_refresh: Duration::ZERO,
            dispatch_idle: Duration::from_millis(5),
            ..DeviceSettings::default()
        }
    }

    pub(crate) fn device_with(fake: &Arc<FakeTransport>, bus: &EventBus) -> Device {
        Device::new(props("uuid:r1"), fake.clone(), bus.clone(), fast_settings())
    }

    pub(crate) fn transport_event(state: &str) -> String {
        format!(
            r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event&gt;&lt;InstanceID val="0"&gt;&lt;TransportState val="{state}"/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn media(uri: &str) -> MediaInfo {
        MediaInfo {
            uri: uri.to_string(),
            title: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn repeated_volume_sets_dispatch_once_with_latest_value() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());

        device.set_volume(30);
        device.set_volume(70);
        assert_eq!(device.pending_commands(), vec![DeviceCommand::SetVolume(70)]);

        device.start();
        eventually(|| !fake.calls("SetVolume").is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = fake.calls("SetVolume");
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .args
            .contains(&("DesiredVolume".to_string(), "70".to_string())));
        assert_eq!(device.volume(), Some(70));
        device.dispose().await;
    }

    #[tokio::test]
    async fn transport_commands_coalesce_into_the_last_one() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        device.play();
        device.seek(Duration::from_secs(30));
        device.pause();
        device.stop();
        assert_eq!(
            device.pending_commands(),
            vec![DeviceCommand::Seek(Duration::from_secs(30)), DeviceCommand::Stop]
        );

        // Repeating the pending intent keeps its place.
        device.set_volume(10);
        device.stop();
        assert_eq!(
            device.pending_commands(),
            vec![
                DeviceCommand::Seek(Duration::from_secs(30)),
                DeviceCommand::Stop,
                DeviceCommand::SetVolume(10),
            ]
        );
    }

    #[tokio::test]
    async fn newest_transport_intent_is_dispatched_last() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        device.play();
        device.seek(Duration::from_secs(30));
        device.stop();
        device.start();

        eventually(|| !fake.calls("Stop").is_empty()).await;
        let sent: Vec<_> = fake
            .actions()
            .into_iter()
            .filter(|a| matches!(a.as_str(), "Play" | "Seek" | "Stop"))
            .collect();
        assert_eq!(sent, vec!["Seek", "Stop"]);
        device.dispose().await;
    }

    #[tokio::test]
    async fn relative_volume_and_mute_build_on_pending_intent() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());

        device.volume_up();
        assert_eq!(device.pending_commands(), vec![DeviceCommand::SetVolume(5)]);
        device.set_volume(98);
        device.volume_up();
        assert_eq!(device.pending_commands(), vec![DeviceCommand::SetVolume(100)]);
        device.volume_down();
        assert_eq!(device.pending_commands(), vec![DeviceCommand::SetVolume(95)]);

        device.toggle_mute();
        assert!(device.pending_commands().contains(&DeviceCommand::SetMute(true)));
        device.toggle_mute();
        assert!(device.pending_commands().contains(&DeviceCommand::SetMute(false)));
    }

    #[tokio::test]
    async fn three_failed_polls_make_the_device_unavailable() {
        let fake = Arc::new(FakeTransport::default());
        fake.fail("GetTransportInfo");
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let device = device_with(&fake, &bus);
        device.start();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::Device(DeviceEvent::Unavailable { ref device }) if device == "uuid:r1"
        ));
        eventually(|| device.is_disposed()).await;
        assert_eq!(fake.calls("GetTransportInfo").len(), 3);
        eventually(|| fake.unsubscribed.lock().len() == 2).await;
        assert!(device.subscription_ids().is_empty());
    }

    #[tokio::test]
    async fn two_failures_followed_by_success_are_not_escalated() {
        let fake = Arc::new(FakeTransport::default());
        fake.script("GetTransportInfo", vec![None, None]);
        fake.respond("GetTransportInfo", &[("CurrentTransportState", "PLAYING")]);
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let device = device_with(&fake, &bus);
        device.start();

        eventually(|| device.is_playing()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!device.is_disposed());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, Event::Device(DeviceEvent::Unavailable { .. })));
        }
        device.dispose().await;
    }

    #[tokio::test]
    async fn later_event_overrides_earlier_poll() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        device.inner.sids.write().push("uuid:sub-a".to_string());

        assert!(device.apply_transport_state(TransportState::Playing, device.next_stamp()));
        assert!(device.apply_transport_state(TransportState::Stopped, device.next_stamp()));
        assert!(device.on_event("uuid:sub-a", &transport_event("PLAYING")));
        assert_eq!(device.transport_state(), Some(TransportState::Playing));
    }

    #[tokio::test]
    async fn slow_poll_answer_does_not_regress_fresher_event() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        device.inner.sids.write().push("uuid:sub-a".to_string());
        device.apply_transport_state(TransportState::Playing, device.next_stamp());

        let poll_stamp = device.next_stamp();
        assert!(device.on_event("uuid:sub-a", &transport_event("PLAYING")));
        assert!(!device.apply_transport_state(TransportState::Stopped, poll_stamp));
        assert_eq!(device.transport_state(), Some(TransportState::Playing));
    }

    #[tokio::test]
    async fn in_flight_poll_loses_to_event_that_arrives_during_it() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("GetTransportInfo", &[("CurrentTransportState", "STOPPED")]);
        fake.delay("GetTransportInfo", Duration::from_millis(150));
        let device = device_with(&fake, &EventBus::new());
        device.start();

        eventually(|| !fake.calls("GetTransportInfo").is_empty()).await;
        let sid = device.subscription_ids()[0].clone();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(device.on_event(&sid, &transport_event("PLAYING")));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(device.transport_state(), Some(TransportState::Playing));
        device.dispose().await;
    }

    #[tokio::test]
    async fn events_for_foreign_subscriptions_are_rejected() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        assert!(!device.on_event("uuid:someone-else", &transport_event("PLAYING")));
        assert_eq!(device.transport_state(), None);
    }

    #[tokio::test]
    async fn stopped_disarms_the_timer_until_a_command() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("GetTransportInfo", &[("CurrentTransportState", "STOPPED")]);
        let device = device_with(&fake, &EventBus::new());
        device.start();

        eventually(|| device.timer_mode() == TimerMode::Never).await;
        let polls = fake.calls("GetTransportInfo").len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fake.calls("GetTransportInfo").len(), polls);

        device.play();
        eventually(|| fake.calls("GetTransportInfo").len() > polls).await;
        device.dispose().await;
    }

    #[tokio::test]
    async fn set_av_transport_then_plays_with_headers() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        let headers = HashMap::from([("transferMode.dlna.org".to_string(), "Streaming".to_string())]);
        device.set_av_transport("http://host/a.mkv", headers, "<DIDL-Lite/>", true);
        device.start();

        eventually(|| !fake.calls("Play").is_empty()).await;
        let actions: Vec<_> = fake
            .actions()
            .into_iter()
            .filter(|a| a == "SetAVTransportURI" || a == "Play")
            .collect();
        assert_eq!(actions, vec!["SetAVTransportURI", "Play"]);
        let set = &fake.calls("SetAVTransportURI")[0];
        assert_eq!(set.headers["transferMode.dlna.org"], "Streaming");
        device.dispose().await;
    }

    #[tokio::test]
    async fn poll_reports_media_start_then_progress() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("GetTransportInfo", &[("CurrentTransportState", "PLAYING")]);
        fake.respond(
            "GetPositionInfo",
            &[
                ("TrackURI", "http://host/a.mp3"),
                ("RelTime", "0:00:07"),
                ("TrackDuration", "0:03:00"),
            ],
        );
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let mut settings = fast_settings();
        settings.refresh_throttle = Duration::ZERO;
        let device = Device::new(props("uuid:r1"), fake.clone(), bus.clone(), settings);
        device.start();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Event::Device(event) = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                seen.push(event);
            }
        }
        assert!(matches!(seen[0], DeviceEvent::PlaybackStart { .. }));
        assert!(matches!(
            seen[1],
            DeviceEvent::PlaybackProgress { position: Some(p), .. } if p == Duration::from_secs(7)
        ));
        assert_eq!(device.duration(), Some(Duration::from_secs(180)));
        device.dispose().await;
    }

    fn last_change(fields: &[(&str, &str)]) -> String {
        let vals: String = fields
            .iter()
            .map(|(name, val)| format!("&lt;{name} val=\"{val}\"/&gt;"))
            .collect();
        format!(
            r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event&gt;&lt;InstanceID val="0"&gt;{vals}&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#
        )
    }

    fn drain_device_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<DeviceEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Device(event) = event {
                seen.push(event);
            }
        }
        seen
    }

    #[tokio::test]
    async fn stopped_event_carrying_a_new_uri_reports_playback_stopped() {
        let fake = Arc::new(FakeTransport::default());
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let device = device_with(&fake, &bus);
        device.inner.sids.write().push("uuid:sub-a".to_string());

        assert!(device.on_event(
            "uuid:sub-a",
            &last_change(&[("TransportState", "PLAYING"), ("CurrentTrackURI", "http://h/a")]),
        ));
        assert!(device.on_event(
            "uuid:sub-a",
            &last_change(&[("TransportState", "STOPPED"), ("CurrentTrackURI", "http://h/b")]),
        ));

        assert_eq!(device.transport_state(), Some(TransportState::Stopped));
        assert_eq!(device.current_media(), None);
        let seen = drain_device_events(&mut events);
        assert_eq!(seen.len(), 2, "{seen:?}");
        assert!(matches!(seen[0], DeviceEvent::PlaybackStart { .. }));
        assert!(matches!(
            &seen[1],
            DeviceEvent::PlaybackStopped { media, .. } if media.uri == "http://h/a"
        ));
        assert_eq!(device.timer_mode(), TimerMode::Never);
    }

    #[tokio::test]
    async fn event_media_is_classified_against_the_reported_state() {
        let fake = Arc::new(FakeTransport::default());
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let device = device_with(&fake, &bus);
        device.inner.sids.write().push("uuid:sub-a".to_string());
        device.apply_transport_state(TransportState::Stopped, device.next_stamp());

        assert!(device.on_event(
            "uuid:sub-a",
            &last_change(&[
                ("TransportState", "PLAYING"),
                ("CurrentTrackURI", "http://h/a"),
                ("RelativeTimePosition", "0:00:04"),
            ]),
        ));

        assert_eq!(device.current_media().map(|m| m.uri).as_deref(), Some("http://h/a"));
        let seen = drain_device_events(&mut events);
        assert_eq!(seen.len(), 1, "{seen:?}");
        assert!(matches!(seen[0], DeviceEvent::PlaybackStart { .. }));
        assert_eq!(device.position(), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn facts_are_not_refetched_within_the_throttle_window() {
        let fake = Arc::new(FakeTransport::default());
        fake.respond("GetTransportInfo", &[("CurrentTransportState", "PLAYING")]);
        let device = device_with(&fake, &EventBus::new());
        assert_eq!(device.inner.settings.refresh_throttle, Duration::from_secs(5));
        device.start();

        eventually(|| !fake.calls("GetMute").is_empty()).await;
        // Many Normal-mode ticks at a 10ms poll interval.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(device.timer_mode(), TimerMode::Normal);
        for action in ["GetTransportInfo", "GetPositionInfo", "GetMediaInfo", "GetVolume", "GetMute"] {
            assert_eq!(fake.calls(action).len(), 1, "{action}");
        }

        // A command forces the next poll to refresh everything.
        device.pause();
        eventually(|| fake.calls("GetTransportInfo").len() == 2).await;
        eventually(|| fake.calls("GetVolume").len() == 2).await;
        device.dispose().await;
    }

    #[tokio::test]
    async fn subscriptions_renew_at_half_the_granted_timeout() {
        let fake = Arc::new(FakeTransport::default());
        fake.grant(Duration::from_millis(200));
        let device = device_with(&fake, &EventBus::new());
        device.start();

        eventually(|| device.subscription_ids().len() == 2).await;
        let first = fake.subscribes.lock().clone();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, renew)| renew.is_none()));

        // Not yet due: well inside the first half of the grant.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fake.subscribes.lock().len(), 2);

        eventually(|| fake.subscribes.lock().len() >= 4).await;
        let renewals = fake.subscribes.lock()[2..4].to_vec();
        let original: Vec<String> = device.subscription_ids();
        for (_, renew) in &renewals {
            let sid = renew.as_ref().expect("renewal carries the previous sid");
            assert!(original.contains(sid));
        }
        device.dispose().await;
    }

    #[tokio::test]
    async fn failed_renewal_falls_back_to_a_fresh_subscription() {
        let fake = Arc::new(FakeTransport::default());
        fake.grant(Duration::from_millis(60));
        fake.fail_renewals();
        let device = device_with(&fake, &EventBus::new());
        device.start();

        eventually(|| device.subscription_ids().len() == 2).await;
        let before = device.subscription_ids();
        eventually(|| {
            let now = device.subscription_ids();
            now.len() == 2 && now.iter().all(|sid| !before.contains(sid))
        })
        .await;

        let calls = fake.subscribes.lock().clone();
        let renewed = calls
            .iter()
            .position(|(_, renew)| renew.as_ref() == Some(&before[0]))
            .expect("renewal attempted with the old sid");
        assert_eq!(calls[renewed + 1].0, calls[renewed].0);
        assert_eq!(calls[renewed + 1].1, None);
        assert!(!device.owns_subscription(&before[0]));
        device.dispose().await;
    }

    #[tokio::test]
    async fn disposed_device_ignores_commands() {
        let fake = Arc::new(FakeTransport::default());
        let device = device_with(&fake, &EventBus::new());
        device.dispose().await;
        device.play();
        assert!(device.pending_commands().is_empty());
    }

    #[test]
    fn media_transitions_map_to_one_notification() {
        let a = media("http://h/a");
        let b = media("http://h/b");
        let playing = Some(TransportState::Playing);

        assert_eq!(classify_media_change("d", None, None, playing, None), None);
        assert!(matches!(
            classify_media_change("d", None, Some(a.clone()), playing, None),
            Some(DeviceEvent::PlaybackStart { .. })
        ));
        assert_eq!(
            classify_media_change("d", None, Some(a.clone()), Some(TransportState::Stopped), None),
            None
        );
        assert!(matches!(
            classify_media_change("d", Some(a.clone()), Some(a.clone()), playing, None),
            Some(DeviceEvent::PlaybackProgress { .. })
        ));
        assert!(matches!(
            classify_media_change("d", Some(a.clone()), Some(b), playing, None),
            Some(DeviceEvent::MediaChanged { .. })
        ));
        assert!(matches!(
            classify_media_change("d", Some(a), None, playing, None),
            Some(DeviceEvent::PlaybackStopped { .. })
        ));
    }

    #[test]
    fn empty_or_sentinel_uris_are_no_media() {
        assert!(media_from(Some(""), None).is_none());
        assert!(media_from(Some("NOT_IMPLEMENTED"), None).is_none());
        let m = media_from(
            Some("http://h/a"),
            Some("&lt;DIDL-Lite&gt;&lt;dc:title&gt;Intro&lt;/dc:title&gt;&lt;/DIDL-Lite&gt;"),
        )
        .unwrap();
        assert_eq!(m.title.as_deref(), Some("Intro"));
    }
}
