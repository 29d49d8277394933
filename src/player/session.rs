use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serenity::model::id::GuildId;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendSet, LoadedStream, StreamBody};
use crate::cache::CacheStore;
use crate::player::announce::Announcer;
use crate::player::queue::{
    AddSummary, HistoryEntry, LoopMode, QueueCaps, QueueFull, QueueSnapshot, TrackQueue,
};
use crate::player::render::{ConvolutionEffect, EndNotifier, RenderHandle, RenderOptions, RenderSink};
use crate::track::{NowPlayingCard, Track};

/// Parámetros de una sesión; los fija la configuración global al crearla.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub caps: QueueCaps,
    pub default_volume: f32,
    /// Inactividad tras la cual el registro abandona el canal de voz.
    pub auto_leave: Duration,
    /// Espera antes de lanzar las descargas diferidas a caché, para que un
    /// salto inmediato no pague descargas de pistas que nunca sonarán.
    pub cache_debounce: Duration,
    /// Pausa entre parar un render y relanzarlo en un seek, para que el
    /// driver drene el stop antes del nuevo arranque.
    pub seek_drain: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            caps: QueueCaps::default(),
            default_volume: 0.5,
            auto_leave: Duration::from_secs(300),
            cache_debounce: Duration::from_secs(3),
            seek_drain: Duration::from_millis(150),
        }
    }
}

/// Qué está sonando y desde cuándo, para `/nowplaying`.
#[derive(Debug, Clone)]
pub struct NowPlayingStatus {
    pub card: NowPlayingCard,
    pub elapsed: Duration,
    pub paused: bool,
    pub loop_mode: LoopMode,
}

/// Render en curso. El `playback_id` es la generación: los avisos de fin
/// que lleguen con una generación vieja no mueven la sesión.
struct ActiveRender {
    handle: Box<dyn RenderHandle>,
    playback_id: u64,
    base_offset: Duration,
    started_at: Instant,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

impl ActiveRender {
    fn progress(&self) -> Duration {
        let paused_now = self.paused_since.map(|s| s.elapsed()).unwrap_or_default();
        self.base_offset + self.started_at.elapsed().saturating_sub(self.paused_total + paused_now)
    }

    fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }
}

/// Todo el estado mutable de la sesión, siempre bajo el mismo candado:
/// cada transición (fin → avance → arranque) es atómica vista desde fuera.
struct SessionState {
    queue: TrackQueue,
    active: Option<ActiveRender>,
    next_playback_id: u64,
    /// Reinicio por seek en curso: los fines de render intermedios no
    /// deben avanzar la cola.
    is_seeking: bool,
    /// El último cambio de pista vino de un salto: el anuncio de
    /// "reproduciendo ahora" sería redundante con la respuesta al comando.
    skipped: bool,
    /// El frente de la cola es una vuelta atrás: al terminar no se
    /// re-apunta en historial ni en la pila de anteriores.
    previous: bool,
    volume: f32,
    effect: Option<ConvolutionEffect>,
    last_played: Instant,
    /// Claves backend:id ya mandadas a la canalización de caché; cada
    /// pista se descarga a lo sumo una vez por sesión.
    cached_songs: HashSet<String>,
    last_announced_entry: Option<u64>,
}

/// Motor de reproducción de una guild.
///
/// Una sesión es dueña de su cola, su render activo y sus tareas de
/// fondo (precarga y caché diferida). Todas las operaciones toman el
/// candado del estado; el token de cancelación corta las tareas de fondo
/// al destruirla.
pub struct PlaybackSession {
    guild_id: GuildId,
    backends: Arc<BackendSet>,
    cache: Arc<CacheStore>,
    http: reqwest::Client,
    sink: Arc<dyn RenderSink>,
    announcer: Arc<dyn Announcer>,
    cfg: SessionConfig,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    /// Auto-referencia débil para los avisos de fin y las tareas de
    /// fondo: no mantienen viva la sesión tras el teardown.
    weak_self: Weak<Self>,
}

impl PlaybackSession {
    pub fn new(
        guild_id: GuildId,
        backends: Arc<BackendSet>,
        cache: Arc<CacheStore>,
        http: reqwest::Client,
        sink: Arc<dyn RenderSink>,
        announcer: Arc<dyn Announcer>,
        cfg: SessionConfig,
    ) -> Arc<Self> {
        let state = SessionState {
            queue: TrackQueue::new(cfg.caps),
            active: None,
            next_playback_id: 0,
            is_seeking: false,
            skipped: false,
            previous: false,
            volume: cfg.default_volume.clamp(0.0, 2.0),
            effect: None,
            last_played: Instant::now(),
            cached_songs: HashSet::new(),
            last_announced_entry: None,
        };
        info!("🎧 Sesión creada para guild {guild_id}");
        Arc::new_cyclic(|weak_self| Self {
            guild_id,
            backends,
            cache,
            http,
            sink,
            announcer,
            cfg,
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Encola pistas y arranca la reproducción si la sesión estaba ociosa.
    pub async fn add_to_queue(
        &self,
        tracks: Vec<Track>,
        play_next: bool,
    ) -> Result<AddSummary, QueueFull> {
        let mut st = self.state.lock().await;
        let summary = st.queue.add(tracks, play_next)?;
        if st.active.is_none() && !st.is_seeking {
            self.start_playing_locked(&mut st, Duration::ZERO, false).await;
        } else {
            self.spawn_deferred_cache(&mut st);
        }
        Ok(summary)
    }

    /// Salta la pista actual. Escapa del loop de una; el de cola sigue.
    pub async fn skip_track(&self) -> bool {
        let mut st = self.state.lock().await;
        let Some(active) = st.active.take() else {
            return false;
        };
        st.queue.escape_track_loop();
        st.skipped = true;
        active.handle.stop();
        if let Some(current) = st.queue.current().cloned() {
            info!("⏭️ Saltando {} en guild {}", current, self.guild_id);
            current.close_stream(false).await;
        }
        self.play_next_locked(&mut st).await;
        true
    }

    /// Vuelve a la última pista sonada. La actual se interrumpe y queda
    /// como siguiente; su replay no ensucia historial.
    pub async fn play_previous(&self) -> bool {
        let mut st = self.state.lock().await;
        if !st.queue.has_previous() {
            return false;
        }
        if let Some(active) = st.active.take() {
            active.handle.stop();
            if let Some(current) = st.queue.current().cloned() {
                current.close_stream(false).await;
            }
        }
        st.queue.restore_previous();
        st.previous = true;
        self.start_playing_locked(&mut st, Duration::ZERO, false).await;
        true
    }

    /// Búsqueda por reinicio: para el render y relanza la misma pista
    /// desde `position`. El candado se mantiene de punta a punta, así que
    /// el fin del render viejo nunca puede avanzar la cola en medio.
    pub async fn seek(&self, position: Duration) -> bool {
        let mut st = self.state.lock().await;
        if st.active.is_none() {
            return false;
        }
        let position = match st.queue.current().and_then(|t| t.duration()) {
            Some(total) => position.min(total),
            None => position,
        };
        debug!("⏩ Seek a {:?} en guild {}", position, self.guild_id);
        self.restart_locked(&mut st, position).await;
        true
    }

    /// Cambia el efecto de render. Con una pista sonando, el cambio
    /// reinicia el render en la posición actual.
    pub async fn set_effect(&self, effect: Option<ConvolutionEffect>) {
        let mut st = self.state.lock().await;
        st.effect = effect;
        if st.active.is_some() {
            let position = st.active.as_ref().map(|a| a.progress()).unwrap_or_default();
            self.restart_locked(&mut st, position).await;
        }
    }

    pub async fn pause(&self) -> bool {
        let mut st = self.state.lock().await;
        match st.active.as_mut() {
            Some(active) if !active.is_paused() => {
                active.handle.pause();
                active.paused_since = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    pub async fn resume(&self) -> bool {
        let mut st = self.state.lock().await;
        match st.active.as_mut() {
            Some(active) => match active.paused_since.take() {
                Some(since) => {
                    active.paused_total += since.elapsed();
                    active.handle.resume();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Fija el volumen de la sesión (0.0–2.0) y lo aplica en caliente.
    pub async fn set_volume(&self, volume: f32) -> f32 {
        let mut st = self.state.lock().await;
        st.volume = volume.clamp(0.0, 2.0);
        if let Some(active) = &st.active {
            active.handle.set_volume(st.volume);
        }
        st.volume
    }

    pub async fn volume(&self) -> f32 {
        self.state.lock().await.volume
    }

    pub async fn set_loop(&self, mode: LoopMode) {
        let mut st = self.state.lock().await;
        st.queue.set_loop(mode);
    }

    pub async fn toggle_shuffle(&self) -> bool {
        let mut st = self.state.lock().await;
        st.queue.toggle_shuffle()
    }

    /// Vacía la cola menos la actual; los streams desalojados se cierran.
    pub async fn clear_queue(&self) -> usize {
        let mut st = self.state.lock().await;
        let evicted = st.queue.clear_upcoming();
        let n = evicted.len();
        drop(st);
        for track in evicted {
            track.close_stream(true).await;
        }
        n
    }

    /// Quita la entrada en `position` (1 = la siguiente) y devuelve su
    /// título. La posición 0 es la pista sonando: eso es un salto.
    pub async fn remove_track(&self, position: usize) -> Option<String> {
        let mut st = self.state.lock().await;
        let removed = st.queue.remove(position)?;
        drop(st);
        let title = removed.title().to_string();
        removed.close_stream(true).await;
        Some(title)
    }

    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        self.state.lock().await.queue.snapshot()
    }

    pub async fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.state.lock().await.queue.history_snapshot()
    }

    pub async fn now_playing(&self) -> Option<NowPlayingStatus> {
        let st = self.state.lock().await;
        let active = st.active.as_ref()?;
        let card = st.queue.current()?.card();
        Some(NowPlayingStatus {
            card,
            elapsed: active.progress(),
            paused: active.is_paused(),
            loop_mode: st.queue.loop_mode(),
        })
    }

    /// Cuánto lleva la sesión sin sonar; `None` mientras haya render.
    pub async fn idle_for(&self) -> Option<Duration> {
        let st = self.state.lock().await;
        match &st.active {
            Some(_) => None,
            None => Some(st.last_played.elapsed()),
        }
    }

    /// Destruye la sesión: corta tareas de fondo, para el render y suelta
    /// todos los streams. El registro la llama al salir del canal.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let mut st = self.state.lock().await;
        if let Some(active) = st.active.take() {
            active.handle.stop();
        }
        let drained = st.queue.drain_all();
        drop(st);
        futures::future::join_all(drained.iter().map(|t| t.close_stream(true))).await;
        info!("🛑 Sesión de guild {} destruida", self.guild_id);
    }

    // ---- transiciones internas (siempre con el candado tomado) ----

    /// Arranca el frente de la cola. Cada pista que no consigue stream en
    /// ningún backend avisa una vez y se descarta, y se sigue con la
    /// siguiente; `quiet` suprime el anuncio (reinicios por seek/efecto).
    async fn start_playing_locked(
        &self,
        st: &mut SessionState,
        start: Duration,
        quiet: bool,
    ) {
        let mut start = start;
        let mut failures = 0usize;
        // Con el loop de cola activo una cola donde todo falla se
        // reciclaría sin fin; pasado el presupuesto se apaga el loop y el
        // drenaje termina solo.
        let failure_budget = st.queue.len().saturating_mul(2).max(4);

        loop {
            let Some(track) = st.queue.current().cloned() else {
                break;
            };

            let loaded = match track.load_stream(&self.backends).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("🚫 Sin stream para {} en guild {}: {}", track, self.guild_id, e);
                    self.announcer.track_unavailable(&track.card()).await;
                    failures += 1;
                    if failures == failure_budget {
                        warn!("⛔ Demasiados fallos seguidos, apagando la repetición");
                        st.queue.set_loop(LoopMode::Off);
                    }
                    st.queue.escape_track_loop();
                    let previous_replay = std::mem::take(&mut st.previous);
                    st.queue.complete_current(previous_replay);
                    track.close_stream(true).await;
                    start = Duration::ZERO;
                    continue;
                }
            };

            st.next_playback_id += 1;
            let playback_id = st.next_playback_id;
            if let Some(stale) = st.active.take() {
                stale.handle.stop();
            }

            let opts = RenderOptions {
                volume: st.volume,
                effect: st.effect.clone(),
                start_offset: start,
            };
            let on_end = self.end_notifier(playback_id);

            match self.sink.start(self.guild_id, &loaded, opts, on_end).await {
                Ok(handle) => {
                    info!(
                        "▶️ Reproduciendo {} en guild {} ({})",
                        track,
                        self.guild_id,
                        loaded.describe()
                    );
                    st.active = Some(ActiveRender {
                        handle,
                        playback_id,
                        base_offset: start,
                        started_at: Instant::now(),
                        paused_since: None,
                        paused_total: Duration::ZERO,
                    });
                    st.last_played = Instant::now();

                    let replaying = st.queue.loop_mode() == LoopMode::Track
                        && st.last_announced_entry == Some(track.entry_id());
                    let skipped = std::mem::take(&mut st.skipped);
                    if !quiet && !skipped && !replaying {
                        self.announcer.now_playing(&track.card()).await;
                    }
                    st.last_announced_entry = Some(track.entry_id());

                    self.spawn_prefetch(st.queue.upcoming().cloned());
                    self.spawn_deferred_cache(st);
                    return;
                }
                Err(e) => {
                    warn!("🚫 El render no arrancó para {}: {}", track, e);
                    self.announcer.track_unavailable(&track.card()).await;
                    failures += 1;
                    if failures == failure_budget {
                        st.queue.set_loop(LoopMode::Off);
                    }
                    st.queue.escape_track_loop();
                    let previous_replay = std::mem::take(&mut st.previous);
                    st.queue.complete_current(previous_replay);
                    track.close_stream(true).await;
                    start = Duration::ZERO;
                }
            }
        }

        st.skipped = false;
        st.previous = false;
        if failures > 0 {
            info!("⏹️ Cola drenada tras {failures} fallos en guild {}", self.guild_id);
            self.announcer.queue_finished().await;
        }
    }

    /// Rotación tras un fin de render (o un salto): completa la actual y
    /// arranca la siguiente, o anuncia el final de la cola.
    async fn play_next_locked(&self, st: &mut SessionState) {
        let previous_replay = std::mem::take(&mut st.previous);
        st.queue.complete_current(previous_replay);

        if st.queue.is_empty() {
            st.skipped = false;
            info!("🏁 Cola terminada en guild {}", self.guild_id);
            self.announcer.queue_finished().await;
            return;
        }
        self.start_playing_locked(st, Duration::ZERO, false).await;
    }

    /// Para el render actual y relanza la misma pista en `position`.
    async fn restart_locked(&self, st: &mut SessionState, position: Duration) {
        st.is_seeking = true;
        if let Some(active) = st.active.take() {
            active.handle.stop();
        }
        if !self.cfg.seek_drain.is_zero() {
            tokio::time::sleep(self.cfg.seek_drain).await;
        }
        self.start_playing_locked(st, position, true).await;
        st.is_seeking = false;
    }

    /// Aviso de fin que el sink dispara exactamente una vez por render.
    /// Sobrevive a la sesión solo como referencia débil: un aviso tardío
    /// tras el teardown no hace nada.
    fn end_notifier(&self, playback_id: u64) -> EndNotifier {
        let weak = self.weak_self.clone();
        Arc::new(move |render_error| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                session.after_playing(playback_id, render_error).await;
            });
        })
    }

    /// Reacción al fin de un render: suelta el stream de la pista
    /// terminada y avanza. Las generaciones viejas (seek, salto, stop
    /// manual) se descartan aquí.
    async fn after_playing(&self, playback_id: u64, render_error: Option<String>) {
        let mut st = self.state.lock().await;
        st.last_played = Instant::now();

        if let Some(e) = &render_error {
            error!("❌ Render terminado con error en guild {}: {}", self.guild_id, e);
        }

        match &st.active {
            Some(active) if active.playback_id == playback_id => {
                st.active = None;
            }
            _ => {
                debug!("Fin de render obsoleto ignorado (generación {playback_id})");
                return;
            }
        }

        if st.is_seeking {
            return;
        }

        if let Some(finished) = st.queue.current().cloned() {
            finished.close_stream(false).await;
        }

        if !self.sink.is_connected(self.guild_id) {
            debug!("🔌 Sin conexión de voz en guild {}, no se avanza", self.guild_id);
            return;
        }
        self.play_next_locked(&mut st).await;
    }

    // ---- tareas de fondo ----

    /// Precarga ligera de la siguiente pista: comprobación de backends y
    /// materialización del embed, nunca una descarga.
    fn spawn_prefetch(&self, upcoming: Option<Track>) {
        let Some(track) = upcoming else {
            return;
        };
        let backends = self.backends.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            if !backends.any_candidate(&track) {
                warn!("⚠️ Ningún backend aplica para la siguiente pista {}", track);
            }
            let _ = track.card();
        });
    }

    /// Canalización de caché diferida: tras un pequeño debounce baja a
    /// disco la pista actual y la siguiente, resolviendo un *segundo*
    /// stream para no tocar el que el render está leyendo.
    fn spawn_deferred_cache(&self, st: &mut SessionState) {
        let mut candidates = Vec::new();
        for track in st.queue.current().into_iter().chain(st.queue.upcoming()) {
            let key = format!("{}:{}", track.service(), track.id());
            if st.cached_songs.insert(key) {
                candidates.push(track.clone());
            }
        }
        if candidates.is_empty() {
            return;
        }

        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        let debounce = self.cfg.cache_debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => {}
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            for track in candidates {
                session.cache_one(track).await;
            }
        });
    }

    /// Baja una pista a la caché de disco. La cancelación de la sesión
    /// aborta la descarga (el writer a medias se descarta como fallido).
    async fn cache_one(&self, track: Track) {
        if track.is_file_backed().await {
            return;
        }

        let loaded = match self.backends.resolve(&track).await {
            Ok(loaded) => loaded,
            Err(e) => {
                debug!("Caché diferida sin stream para {}: {}", track, e);
                return;
            }
        };
        if loaded.is_file() {
            return;
        }

        let backend = loaded.backend;
        let native_id = loaded.native_id.clone();
        let ext = loaded.container.clone();
        let expected = match &loaded.body {
            StreamBody::Media(media) => media.byte_len(),
            StreamBody::Http { content_length, .. } => *content_length,
            StreamBody::File(_) => return,
        };

        let mut writer = match self.cache.begin(backend.as_str(), &native_id, &ext, expected) {
            Ok(writer) => writer,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return,
            Err(e) => {
                warn!("⚠️ Caché diferida sin writer para {}: {}", track, e);
                return;
            }
        };

        let copied = match &loaded.body {
            StreamBody::Media(media) => self.copy_media(media.clone(), &mut writer).await,
            StreamBody::Http { url, headers, .. } => {
                self.copy_http(url.clone(), headers.clone(), &mut writer).await
            }
            StreamBody::File(_) => return,
        };

        match copied {
            Ok(true) => match writer.finish().await {
                Ok(path) => {
                    info!("💾 Caché diferida sellada para {}: {}", track, path.display());
                    track
                        .set_stream(LoadedStream {
                            backend,
                            native_id,
                            container: ext,
                            single_use: false,
                            body: StreamBody::File(path),
                        })
                        .await;
                }
                Err(e) => warn!("⚠️ No se pudo sellar la caché de {}: {}", track, e),
            },
            Ok(false) => debug!("Descarga a caché de {} cancelada", track),
            Err(e) => warn!("⚠️ Descarga a caché de {} fallida: {}", track, e),
        }
    }

    /// `Ok(false)` = cancelado antes de terminar.
    async fn copy_media(
        &self,
        media: Arc<dyn crate::track::stream::MediaStream>,
        writer: &mut crate::cache::CacheWriter,
    ) -> anyhow::Result<bool> {
        if media.is_seekable() {
            media.seek(0).await?;
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                chunk = media.read_chunk() => {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        return Ok(true);
                    }
                    writer.write_chunk(&chunk).await?;
                }
            }
        }
    }

    async fn copy_http(
        &self,
        url: String,
        headers: reqwest::header::HeaderMap,
        writer: &mut crate::cache::CacheWriter,
    ) -> anyhow::Result<bool> {
        let mut resp = self
            .http
            .get(&url)
            .headers(headers)
            .send()
            .await?
            .error_for_status()?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                chunk = resp.chunk() => {
                    match chunk? {
                        Some(bytes) => writer.write_chunk(&bytes).await?,
                        None => return Ok(true),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendError, BackendKind, StreamBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Start { offset: Duration },
        Stop,
        Pause,
        Resume,
        Volume(u32),
    }

    struct LiveRender {
        on_end: EndNotifier,
        fired: Arc<AtomicBool>,
    }

    /// Sink de mentira: apunta los eventos y verifica en caliente que
    /// nunca haya dos renders vivos a la vez.
    #[derive(Default)]
    struct RecordingSink {
        events: parking_lot::Mutex<Vec<SinkEvent>>,
        live: parking_lot::Mutex<Option<LiveRender>>,
        active: Arc<AtomicBool>,
        connected: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            let sink = Self::default();
            sink.connected.store(true, Ordering::SeqCst);
            Arc::new(sink)
        }

        fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().clone()
        }

        fn starts(&self) -> Vec<Duration> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SinkEvent::Start { offset } => Some(offset),
                    _ => None,
                })
                .collect()
        }

        /// Simula el fin natural del render en curso.
        fn finish_current(&self) {
            let live = self.live.lock().take();
            if let Some(live) = live {
                self.active.store(false, Ordering::SeqCst);
                if !live.fired.swap(true, Ordering::SeqCst) {
                    (live.on_end)(None);
                }
            }
        }
    }

    struct RecordingHandle {
        sink_active: Arc<AtomicBool>,
        events: Arc<RecordingSink>,
        on_end: EndNotifier,
        fired: Arc<AtomicBool>,
    }

    impl RenderHandle for RecordingHandle {
        fn stop(&self) {
            self.events.events.lock().push(SinkEvent::Stop);
            self.sink_active.store(false, Ordering::SeqCst);
            if !self.fired.swap(true, Ordering::SeqCst) {
                (self.on_end)(None);
            }
        }

        fn pause(&self) {
            self.events.events.lock().push(SinkEvent::Pause);
        }

        fn resume(&self) {
            self.events.events.lock().push(SinkEvent::Resume);
        }

        fn set_volume(&self, volume: f32) {
            self.events
                .events
                .lock()
                .push(SinkEvent::Volume((volume * 100.0).round() as u32));
        }
    }

    #[async_trait]
    impl RenderSink for Arc<RecordingSink> {
        async fn start(
            &self,
            _guild: GuildId,
            _stream: &LoadedStream,
            opts: RenderOptions,
            on_end: EndNotifier,
        ) -> anyhow::Result<Box<dyn RenderHandle>> {
            assert!(
                !self.active.swap(true, Ordering::SeqCst),
                "dos renders vivos a la vez"
            );
            self.events.lock().push(SinkEvent::Start {
                offset: opts.start_offset,
            });
            let fired = Arc::new(AtomicBool::new(false));
            *self.live.lock() = Some(LiveRender {
                on_end: on_end.clone(),
                fired: fired.clone(),
            });
            Ok(Box::new(RecordingHandle {
                sink_active: self.active.clone(),
                events: self.clone(),
                on_end,
                fired,
            }))
        }

        fn is_connected(&self, _guild: GuildId) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingAnnouncer {
        played: parking_lot::Mutex<Vec<String>>,
        unavailable: parking_lot::Mutex<Vec<String>>,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn now_playing(&self, card: &NowPlayingCard) {
            self.played.lock().push(card.title.clone());
        }

        async fn track_unavailable(&self, card: &NowPlayingCard) {
            self.unavailable.lock().push(card.title.clone());
        }

        async fn queue_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Backend que nunca sirve nada, para el camino de "no disponible".
    struct DeadBackend;

    #[async_trait]
    impl StreamBackend for DeadBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Extractor
        }

        fn can_serve(&self, _track: &Track) -> bool {
            true
        }

        async fn open(&self, _track: &Track) -> Result<LoadedStream, BackendError> {
            Err(BackendError::Unavailable("apagado".into()))
        }
    }

    struct Harness {
        session: Arc<PlaybackSession>,
        sink: Arc<RecordingSink>,
        announcer: Arc<RecordingAnnouncer>,
        _dir: TempDir,
    }

    fn harness_with(backends: BackendSet) -> Harness {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()).unwrap());
        let sink = RecordingSink::new();
        let announcer = Arc::new(RecordingAnnouncer::default());
        let cfg = SessionConfig {
            seek_drain: Duration::ZERO,
            // Lejos del horizonte de los tests.
            cache_debounce: Duration::from_secs(3600),
            ..SessionConfig::default()
        };
        let session = PlaybackSession::new(
            GuildId::new(99),
            Arc::new(backends),
            cache,
            reqwest::Client::new(),
            Arc::new(sink.clone()),
            announcer.clone(),
            cfg,
        );
        Harness {
            session,
            sink,
            announcer,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(BackendSet::new(Vec::new()))
    }

    /// Pista respaldada por archivo: se sirve sin tocar ningún backend.
    async fn file_track(id: &str, title: &str) -> Track {
        let track = Track::new(BackendKind::Premium, id, title);
        track
            .set_stream(LoadedStream {
                backend: BackendKind::Premium,
                native_id: id.into(),
                container: "mp3".into(),
                single_use: false,
                body: StreamBody::File(format!("/tmp/{id}.mp3").into()),
            })
            .await;
        track
    }

    /// Deja correr las tareas spawneadas (after_playing es asíncrono).
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_agregar_a_cola_vacia_arranca() {
        let h = harness();
        let t = file_track("a", "primera").await;

        let summary = h.session.add_to_queue(vec![t], false).await.unwrap();
        assert!(matches!(summary, AddSummary::Single { .. }));
        assert_eq!(h.sink.starts(), vec![Duration::ZERO]);
        assert_eq!(h.announcer.played.lock().clone(), vec!["primera"]);

        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "primera");
    }

    #[tokio::test]
    async fn test_fin_natural_avanza_y_anuncia() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![file_track("a", "uno").await, file_track("b", "dos").await],
                false,
            )
            .await
            .unwrap();

        h.sink.finish_current();
        settle().await;

        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "dos");
        assert_eq!(h.announcer.played.lock().clone(), vec!["uno", "dos"]);

        let history = h.session.history_snapshot().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "uno");
    }

    #[tokio::test]
    async fn test_salto_escapa_del_loop_de_una() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![file_track("a", "uno").await, file_track("b", "dos").await],
                false,
            )
            .await
            .unwrap();
        h.session.set_loop(LoopMode::Track).await;

        assert!(h.session.skip_track().await);
        settle().await;

        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "dos");
        assert_eq!(snap.loop_mode, LoopMode::Off);
        // El salto no re-anuncia y el fin del render viejo no vuelve a
        // avanzar la cola.
        assert_eq!(h.announcer.played.lock().clone(), vec!["uno"]);
        assert_eq!(h.session.queue_snapshot().await.current.unwrap().title(), "dos");
    }

    #[tokio::test]
    async fn test_salto_de_la_ultima_deja_ociosa_la_sesion() {
        let h = harness();
        h.session
            .add_to_queue(vec![file_track("a", "única").await], false)
            .await
            .unwrap();

        assert!(h.session.skip_track().await);
        settle().await;

        assert!(h.session.now_playing().await.is_none());
        assert!(h.session.queue_snapshot().await.current.is_none());
        assert_eq!(h.announcer.finished.load(Ordering::SeqCst), 1);
        assert!(h.session.idle_for().await.is_some());

        // Sin render no hay nada que saltar.
        assert!(!h.session.skip_track().await);
    }

    #[tokio::test]
    async fn test_seek_reinicia_sin_avanzar() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![
                    file_track("a", "uno").await.with_duration(Duration::from_secs(180)),
                    file_track("b", "dos").await,
                ],
                false,
            )
            .await
            .unwrap();

        assert!(h.session.seek(Duration::from_secs(60)).await);
        settle().await;

        assert_eq!(
            h.sink.starts(),
            vec![Duration::ZERO, Duration::from_secs(60)]
        );
        // La cola no se movió y no hubo re-anuncio.
        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "uno");
        assert_eq!(snap.upcoming.len(), 1);
        assert_eq!(h.announcer.played.lock().clone(), vec!["uno"]);

        let status = h.session.now_playing().await.unwrap();
        assert!(status.elapsed >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_seek_se_recorta_a_la_duracion() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![file_track("a", "corta").await.with_duration(Duration::from_secs(30))],
                false,
            )
            .await
            .unwrap();

        h.session.seek(Duration::from_secs(900)).await;
        assert_eq!(
            h.sink.starts(),
            vec![Duration::ZERO, Duration::from_secs(30)]
        );
    }

    #[tokio::test]
    async fn test_sin_render_no_hay_seek() {
        let h = harness();
        assert!(!h.session.seek(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_pista_imposible_avisa_una_vez_y_salta() {
        let h = harness_with(BackendSet::new(vec![Arc::new(DeadBackend)]));
        let bad = Track::new(BackendKind::Extractor, "x", "rota");
        let good = file_track("b", "buena").await;

        h.session.add_to_queue(vec![bad, good], false).await.unwrap();

        assert_eq!(h.announcer.unavailable.lock().clone(), vec!["rota"]);
        assert_eq!(h.announcer.played.lock().clone(), vec!["buena"]);
        assert_eq!(h.sink.starts(), vec![Duration::ZERO]);
        assert_eq!(
            h.session.queue_snapshot().await.current.unwrap().title(),
            "buena"
        );
    }

    #[tokio::test]
    async fn test_cola_de_puros_fallos_se_drena() {
        let h = harness_with(BackendSet::new(vec![Arc::new(DeadBackend)]));
        let bad1 = Track::new(BackendKind::Extractor, "x", "rota1");
        let bad2 = Track::new(BackendKind::Extractor, "y", "rota2");

        h.session.add_to_queue(vec![bad1, bad2], false).await.unwrap();

        assert_eq!(
            h.announcer.unavailable.lock().clone(),
            vec!["rota1", "rota2"]
        );
        assert!(h.sink.starts().is_empty());
        assert!(h.session.queue_snapshot().await.current.is_none());
        assert_eq!(h.announcer.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_vuelta_atras_replanta_sin_reapuntar() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![file_track("a", "uno").await, file_track("b", "dos").await],
                false,
            )
            .await
            .unwrap();

        h.sink.finish_current();
        settle().await;
        assert_eq!(
            h.session.queue_snapshot().await.current.unwrap().title(),
            "dos"
        );

        assert!(h.session.play_previous().await);
        settle().await;
        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "uno");
        assert_eq!(snap.upcoming[0].title(), "dos");

        // El replay termina sin duplicar historial ni pila.
        h.sink.finish_current();
        settle().await;
        assert_eq!(
            h.session.queue_snapshot().await.current.unwrap().title(),
            "dos"
        );
        assert_eq!(h.session.history_snapshot().await.len(), 1);

        // La pila quedó vacía: no hay más atrás.
        assert!(!h.session.play_previous().await);
    }

    #[tokio::test]
    async fn test_loop_de_cola_recicla() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![file_track("a", "uno").await, file_track("b", "dos").await],
                false,
            )
            .await
            .unwrap();
        h.session.set_loop(LoopMode::Queue).await;

        for _ in 0..2 {
            h.sink.finish_current();
            settle().await;
        }

        // La cola renació en vez de terminar.
        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "uno");
        assert_eq!(h.announcer.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pausa_reanuda_y_volumen() {
        let h = harness();
        h.session
            .add_to_queue(vec![file_track("a", "uno").await], false)
            .await
            .unwrap();

        assert!(h.session.pause().await);
        assert!(!h.session.pause().await);
        assert!(h.session.now_playing().await.unwrap().paused);

        assert!(h.session.resume().await);
        assert!(!h.session.resume().await);

        assert_eq!(h.session.set_volume(5.0).await, 2.0);
        assert!(h.sink.events().contains(&SinkEvent::Pause));
        assert!(h.sink.events().contains(&SinkEvent::Resume));
        assert!(h.sink.events().contains(&SinkEvent::Volume(200)));
    }

    #[tokio::test]
    async fn test_clear_y_remove() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![
                    file_track("a", "uno").await,
                    file_track("b", "dos").await,
                    file_track("c", "tres").await,
                    file_track("d", "cuatro").await,
                ],
                false,
            )
            .await
            .unwrap();

        assert_eq!(h.session.remove_track(2).await.as_deref(), Some("tres"));
        assert!(h.session.remove_track(0).await.is_none());

        assert_eq!(h.session.clear_queue().await, 2);
        let snap = h.session.queue_snapshot().await;
        assert_eq!(snap.current.unwrap().title(), "uno");
        assert!(snap.upcoming.is_empty());
    }

    #[tokio::test]
    async fn test_cambio_de_efecto_reinicia_en_sitio() {
        let h = harness();
        h.session
            .add_to_queue(vec![file_track("a", "uno").await], false)
            .await
            .unwrap();

        h.session
            .set_effect(Some(ConvolutionEffect {
                dry_gain: 0.7,
                wet_gain: 0.3,
                impulse_response: ("/tmp/ir-l.wav".into(), "/tmp/ir-r.wav".into()),
            }))
            .await;
        settle().await;

        let starts = h.sink.starts();
        assert_eq!(starts.len(), 2);
        // Reinicio en la posición en la que iba, sin re-anuncio.
        assert_eq!(h.announcer.played.lock().clone(), vec!["uno"]);
        assert_eq!(
            h.session.queue_snapshot().await.current.unwrap().title(),
            "uno"
        );
    }

    #[tokio::test]
    async fn test_un_solo_render_vivo_bajo_presion() {
        // El RecordingSink hace panic si alguna vez hay dos renders
        // vivos; esta secuencia cubre arranque, seek, salto y fin.
        let h = harness();
        h.session
            .add_to_queue(
                vec![
                    file_track("a", "uno").await,
                    file_track("b", "dos").await,
                    file_track("c", "tres").await,
                ],
                false,
            )
            .await
            .unwrap();

        h.session.seek(Duration::from_secs(10)).await;
        h.session.skip_track().await;
        h.sink.finish_current();
        settle().await;
        h.session.play_previous().await;
        settle().await;

        assert!(h.session.now_playing().await.is_some());
    }

    #[tokio::test]
    async fn test_teardown_suelta_todo() {
        let h = harness();
        let t1 = file_track("a", "uno").await;
        let t2 = file_track("b", "dos").await;
        h.session
            .add_to_queue(vec![t1.clone(), t2.clone()], false)
            .await
            .unwrap();

        h.session.teardown().await;

        assert!(h.session.queue_snapshot().await.current.is_none());
        assert!(!t1.has_stream().await);
        assert!(!t2.has_stream().await);
        assert!(h.session.cancel_token().is_cancelled());
        assert!(h.sink.events().contains(&SinkEvent::Stop));
    }

    #[tokio::test]
    async fn test_desconexion_de_voz_frena_el_avance() {
        let h = harness();
        h.session
            .add_to_queue(
                vec![file_track("a", "uno").await, file_track("b", "dos").await],
                false,
            )
            .await
            .unwrap();

        h.sink.connected.store(false, Ordering::SeqCst);
        h.sink.finish_current();
        settle().await;

        // La pista terminada sigue al frente: nadie arrancó la siguiente.
        assert_eq!(h.sink.starts().len(), 1);
        assert!(h.session.now_playing().await.is_none());
    }
}
