use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::track::Track;

/// Modo de repetición. El enum hace estructural la exclusión: repetir
/// pista y repetir cola no pueden estar activos a la vez.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Off,
    Track,
    Queue,
}

/// Topes de las estructuras acotadas de la sesión.
#[derive(Debug, Clone, Copy)]
pub struct QueueCaps {
    pub max_size: usize,
    pub history: usize,
    pub previous: usize,
}

impl Default for QueueCaps {
    fn default() -> Self {
        Self {
            max_size: 100,
            history: 50,
            previous: 25,
        }
    }
}

/// La cola está llena; ninguna pista nueva entró.
#[derive(Debug, thiserror::Error)]
#[error("la cola está llena (máximo {max} canciones)")]
pub struct QueueFull {
    pub max: usize,
}

/// Resumen que devuelve `add` para que la capa de comandos lo pinte.
/// El escalón (1 / 2–3 / 3 + resto) es contrato; el texto no.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddSummary {
    Single { title: String },
    Few { titles: Vec<String> },
    Many { first: Vec<String>, rest: usize },
}

impl AddSummary {
    fn summarize(added: &[Track]) -> Option<Self> {
        let titles: Vec<String> = added.iter().map(|t| t.title().to_string()).collect();
        match titles.len() {
            0 => None,
            1 => Some(Self::Single {
                title: titles.into_iter().next().unwrap_or_default(),
            }),
            2..=3 => Some(Self::Few { titles }),
            n => Some(Self::Many {
                first: titles.into_iter().take(3).collect(),
                rest: n - 3,
            }),
        }
    }
}

/// Entrada del historial: instantánea de metadatos, nunca la pista viva.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub title: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub cover_url: Option<String>,
    pub source_url: Option<String>,
    pub played_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn snapshot(track: &Track) -> Self {
        Self {
            title: track.title().to_string(),
            artist: track.artist().map(str::to_string),
            duration: track.duration(),
            cover_url: track.cover_url().map(str::to_string),
            source_url: track.source_url().map(str::to_string),
            played_at: Utc::now(),
        }
    }
}

/// Cola de reproducción de una sesión. El índice 0 es la pista sonando
/// (o a punto de sonar); la sesión la muta siempre bajo su candado.
#[derive(Debug)]
pub struct TrackQueue {
    queue: VecDeque<Track>,
    /// Espejo en orden de llegada; de aquí se restaura al desactivar el
    /// modo aleatorio.
    original: Vec<Track>,
    shuffled: bool,
    /// Anillo, la más reciente primero.
    history: VecDeque<HistoryEntry>,
    /// Pila para `play_previous`; se descarta la más vieja al desbordar.
    stack_previous: Vec<Track>,
    /// Pistas ya sonadas que esperan el reciclado del loop de cola.
    to_loop: Vec<Track>,
    loop_mode: LoopMode,
    caps: QueueCaps,
    next_entry_id: u64,
}

impl TrackQueue {
    pub fn new(caps: QueueCaps) -> Self {
        Self {
            queue: VecDeque::new(),
            original: Vec::new(),
            shuffled: false,
            history: VecDeque::new(),
            stack_previous: Vec::new(),
            to_loop: Vec::new(),
            loop_mode: LoopMode::Off,
            caps,
            next_entry_id: 1,
        }
    }

    /// Encola pistas, al final o justo después de la actual. Les asigna
    /// su id de entrada (dos copias de la misma canción son entradas
    /// distintas) y mantiene el espejo de orden original.
    pub fn add(&mut self, tracks: Vec<Track>, play_next: bool) -> Result<AddSummary, QueueFull> {
        let room = self.caps.max_size.saturating_sub(self.queue.len());

        let mut fitting = Vec::with_capacity(tracks.len().min(room));
        for mut track in tracks.into_iter().take(room) {
            track.assign_entry(self.next_entry_id);
            self.next_entry_id += 1;
            fitting.push(track);
        }

        let Some(summary) = AddSummary::summarize(&fitting) else {
            return Err(QueueFull {
                max: self.caps.max_size,
            });
        };

        // En el espejo, "siguiente" significa inmediatamente después de
        // la entrada que está sonando.
        let mirror_base = if play_next {
            self.queue
                .front()
                .and_then(|cur| self.original.iter().position(|t| t.entry_id() == cur.entry_id()))
                .map(|i| i + 1)
                .unwrap_or(0)
        } else {
            self.original.len()
        };
        for (i, track) in fitting.iter().enumerate() {
            self.original.insert(mirror_base + i, track.clone());
        }

        let base = if play_next {
            1.min(self.queue.len())
        } else {
            self.queue.len()
        };
        for (i, track) in fitting.iter().enumerate() {
            self.queue.insert(base + i, track.clone());
        }

        if self.shuffled {
            self.shuffle_tail();
        }

        info!("➕ Agregadas {} pistas a la cola", fitting.len());
        Ok(summary)
    }

    pub fn current(&self) -> Option<&Track> {
        self.queue.front()
    }

    /// Candidata a precarga: la que sonará después de la actual.
    pub fn upcoming(&self) -> Option<&Track> {
        self.queue.get(1)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffled
    }

    pub fn has_previous(&self) -> bool {
        !self.stack_previous.is_empty()
    }

    /// Rotación al terminar la actual: historial, pila de anteriores,
    /// buffers de loop y avance de la cola. Devuelve la pista terminada.
    ///
    /// Un replay (loop de una, o vuelta atrás con `previous_replay`) no
    /// ensucia historial ni pila.
    pub fn complete_current(&mut self, previous_replay: bool) -> Option<Track> {
        let finished = self.queue.front()?.clone();
        let loop_one = self.loop_mode == LoopMode::Track;

        if !loop_one && !previous_replay {
            self.push_previous(finished.clone());
            self.push_history(&finished);
        }

        if self.loop_mode == LoopMode::Queue {
            self.to_loop.push(finished.clone());
        }

        if !loop_one {
            self.queue.pop_front();
            self.forget_original(finished.entry_id());
        }

        if self.queue.is_empty() && self.loop_mode == LoopMode::Queue && !self.to_loop.is_empty() {
            info!("🔁 Cola agotada, reciclando {} pistas", self.to_loop.len());
            self.queue.extend(self.to_loop.drain(..));
            self.original = self.queue.iter().cloned().collect();
        }

        Some(finished)
    }

    /// Saca la última pista sonada de la pila y la planta al frente.
    pub fn restore_previous(&mut self) -> Option<&Track> {
        let track = self.stack_previous.pop()?;
        let mirror_at = self
            .queue
            .front()
            .and_then(|cur| self.original.iter().position(|t| t.entry_id() == cur.entry_id()))
            .unwrap_or(0);
        self.original.insert(mirror_at, track.clone());
        self.queue.push_front(track);
        self.queue.front()
    }

    pub fn set_loop(&mut self, mode: LoopMode) {
        if mode != LoopMode::Queue {
            self.to_loop.clear();
        }
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    /// El salto escapa del loop de una pista; el de cola sobrevive.
    pub fn escape_track_loop(&mut self) {
        if self.loop_mode == LoopMode::Track {
            self.loop_mode = LoopMode::Off;
        }
    }

    /// Activa o desactiva el modo aleatorio. Al activar, mezcla todo
    /// menos la actual; al desactivar, restaura el orden de llegada de
    /// las entradas que siguen en cola.
    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffled = !self.shuffled;
        if self.queue.len() > 1 {
            if self.shuffled {
                self.shuffle_tail();
                info!("🔀 Modo aleatorio activado");
            } else {
                self.restore_order();
                info!("➡️ Modo aleatorio desactivado");
            }
        }
        self.shuffled
    }

    /// Quita la entrada en `position` (1 = la siguiente). La actual no se
    /// quita por aquí: eso es un salto.
    pub fn remove(&mut self, position: usize) -> Option<Track> {
        if position == 0 || position >= self.queue.len() {
            return None;
        }
        let removed = self.queue.remove(position)?;
        self.forget_original(removed.entry_id());
        debug!("❌ Quitada de la cola: {}", removed);
        Some(removed)
    }

    /// Vacía todo menos la actual; devuelve las desalojadas para que la
    /// sesión cierre sus streams.
    pub fn clear_upcoming(&mut self) -> Vec<Track> {
        if self.queue.len() <= 1 {
            self.to_loop.clear();
            return Vec::new();
        }
        let evicted: Vec<Track> = self.queue.drain(1..).collect();
        for track in &evicted {
            self.forget_original(track.entry_id());
        }
        self.to_loop.clear();
        if !evicted.is_empty() {
            info!("🗑️ Cola limpiada ({} pistas)", evicted.len());
        }
        evicted
    }

    /// Drena absolutamente todo (destrucción de la sesión).
    pub fn drain_all(&mut self) -> Vec<Track> {
        self.original.clear();
        self.stack_previous.clear();
        let mut all: Vec<Track> = self.queue.drain(..).collect();
        all.extend(self.to_loop.drain(..));
        all
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.queue.front().cloned(),
            upcoming: self.queue.iter().skip(1).cloned().collect(),
            loop_mode: self.loop_mode,
            shuffled: self.shuffled,
            total_duration: self.queue.iter().filter_map(|t| t.duration()).sum(),
        }
    }

    pub fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history.iter().cloned().collect()
    }

    // Internas

    fn shuffle_tail(&mut self) {
        let tail = self.queue.make_contiguous();
        if tail.len() > 1 {
            tail[1..].shuffle(&mut rand::thread_rng());
        }
    }

    fn restore_order(&mut self) {
        let Some(current_id) = self.queue.front().map(|t| t.entry_id()) else {
            return;
        };
        let enqueued: std::collections::HashSet<u64> =
            self.queue.iter().map(|t| t.entry_id()).collect();

        let mut restored = VecDeque::with_capacity(self.queue.len());
        if let Some(front) = self.queue.front() {
            restored.push_back(front.clone());
        }
        for track in &self.original {
            if track.entry_id() != current_id && enqueued.contains(&track.entry_id()) {
                restored.push_back(track.clone());
            }
        }
        self.queue = restored;
    }

    fn forget_original(&mut self, entry_id: u64) {
        if let Some(i) = self.original.iter().position(|t| t.entry_id() == entry_id) {
            self.original.remove(i);
        }
    }

    fn push_previous(&mut self, track: Track) {
        self.stack_previous.push(track);
        if self.stack_previous.len() > self.caps.previous {
            self.stack_previous.remove(0);
        }
    }

    fn push_history(&mut self, track: &Track) {
        self.history.push_front(HistoryEntry::snapshot(track));
        self.history.truncate(self.caps.history);
    }
}

/// Vista inmutable para los embeds; nada de aquí toca la cola viva.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub upcoming: Vec<Track>,
    pub loop_mode: LoopMode,
    pub shuffled: bool,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let safe_page = page.max(1);
        let start = (safe_page - 1) * per_page;
        let end = (start + per_page).min(self.upcoming.len());
        let total_pages = if self.upcoming.is_empty() {
            1
        } else {
            self.upcoming.len().div_ceil(per_page)
        };

        QueuePage {
            items: if start < self.upcoming.len() {
                self.upcoming[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page: safe_page.min(total_pages),
            total_pages,
            total_items: self.upcoming.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
