use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serenity::model::id::UserId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backends::{BackendError, BackendKind, BackendSet, LoadedStream, StreamBody};

pub mod stream;

/// Generador inspeccionable de streams: las URLs firmadas de un solo uso se
/// regeneran a partir de estos datos, nunca de un closure opaco.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGenerator {
    pub track_id: String,
    pub quality: String,
}

/// Datos de la tarjeta "reproduciendo ahora", materializados bajo demanda.
#[derive(Debug, Clone, Default)]
pub struct NowPlayingCard {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    pub duration: Option<Duration>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
struct TrackMeta {
    service: BackendKind,
    id: String,
    title: String,
    artist: Option<String>,
    artists: Vec<String>,
    album: Option<String>,
    cover_url: Option<String>,
    duration: Option<Duration>,
    track_number: Option<u32>,
    disc_number: Option<u32>,
    date: Option<String>,
    isrc: Option<String>,
    source_url: Option<String>,
    requested_by: Option<UserId>,
}

/// Estado mutable compartido entre todas las copias de una misma pista.
///
/// La cola, el buffer de loop y la pila de "anterior" guardan copias
/// ligeras del mismo Track; todas observan el mismo ciclo de vida del
/// stream a través de este interior compartido.
struct TrackShared {
    slot: Mutex<Option<LoadedStream>>,
    generator: parking_lot::Mutex<Option<StreamGenerator>>,
    card: parking_lot::Mutex<Option<NowPlayingCard>>,
}

/// Pista encolable: identidad, metadatos y ciclo de vida de su stream.
pub struct Track {
    meta: Arc<TrackMeta>,
    shared: Arc<TrackShared>,
    /// Identidad de instancia en la cola, asignada al encolar. Dos copias
    /// de la misma canción encoladas dos veces llevan ids distintos.
    entry_id: u64,
}

impl Clone for Track {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            shared: self.shared.clone(),
            entry_id: self.entry_id,
        }
    }
}

impl Track {
    pub fn new(service: BackendKind, id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            meta: Arc::new(TrackMeta {
                service,
                id: id.into(),
                title: title.into(),
                artist: None,
                artists: Vec::new(),
                album: None,
                cover_url: None,
                duration: None,
                track_number: None,
                disc_number: None,
                date: None,
                isrc: None,
                source_url: None,
                requested_by: None,
            }),
            shared: Arc::new(TrackShared {
                slot: Mutex::new(None),
                generator: parking_lot::Mutex::new(None),
                card: parking_lot::Mutex::new(None),
            }),
            entry_id: 0,
        }
    }

    fn meta_mut(&mut self) -> &mut TrackMeta {
        // Los builders solo corren antes de compartir la pista.
        Arc::make_mut(&mut self.meta)
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.meta_mut().artist = Some(artist.into());
        self
    }

    pub fn with_artists(mut self, artists: Vec<String>) -> Self {
        self.meta_mut().artists = artists;
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.meta_mut().album = Some(album.into());
        self
    }

    pub fn with_cover_url(mut self, url: impl Into<String>) -> Self {
        self.meta_mut().cover_url = Some(url.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.meta_mut().duration = Some(duration);
        self
    }

    pub fn with_track_number(mut self, n: u32) -> Self {
        self.meta_mut().track_number = Some(n);
        self
    }

    pub fn with_disc_number(mut self, n: u32) -> Self {
        self.meta_mut().disc_number = Some(n);
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.meta_mut().date = Some(date.into());
        self
    }

    pub fn with_isrc(mut self, isrc: impl Into<String>) -> Self {
        self.meta_mut().isrc = Some(isrc.into());
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.meta_mut().source_url = Some(url.into());
        self
    }

    pub fn with_requested_by(mut self, user: UserId) -> Self {
        self.meta_mut().requested_by = Some(user);
        self
    }

    pub fn with_generator(self, generator: StreamGenerator) -> Self {
        *self.shared.generator.lock() = Some(generator);
        self
    }

    /// Fija el generador a posteriori (lo hace el backend de catálogo la
    /// primera vez que resuelve la pista, para que los reinicios
    /// regeneren el mismo stream).
    pub fn attach_generator(&self, generator: StreamGenerator) {
        *self.shared.generator.lock() = Some(generator);
    }

    pub fn service(&self) -> BackendKind {
        self.meta.service
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn title(&self) -> &str {
        &self.meta.title
    }

    pub fn artist(&self) -> Option<&str> {
        self.meta.artist.as_deref()
    }

    pub fn artists(&self) -> &[String] {
        &self.meta.artists
    }

    pub fn album(&self) -> Option<&str> {
        self.meta.album.as_deref()
    }

    pub fn cover_url(&self) -> Option<&str> {
        self.meta.cover_url.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.meta.duration
    }

    pub fn track_number(&self) -> Option<u32> {
        self.meta.track_number
    }

    pub fn disc_number(&self) -> Option<u32> {
        self.meta.disc_number
    }

    pub fn date(&self) -> Option<&str> {
        self.meta.date.as_deref()
    }

    pub fn isrc(&self) -> Option<&str> {
        self.meta.isrc.as_deref()
    }

    pub fn source_url(&self) -> Option<&str> {
        self.meta.source_url.as_deref()
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.meta.requested_by
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    /// Fija la identidad de instancia en la cola. Solo el motor de colas
    /// la asigna, una vez por encolado.
    pub(crate) fn assign_entry(&mut self, entry_id: u64) {
        self.entry_id = entry_id;
    }

    pub fn generator(&self) -> Option<StreamGenerator> {
        self.shared.generator.lock().clone()
    }

    /// Tarjeta de reproducción, rellenada desde los metadatos la primera
    /// vez que alguien la pide.
    pub fn card(&self) -> NowPlayingCard {
        let mut card = self.shared.card.lock();
        card.get_or_insert_with(|| NowPlayingCard {
            title: self.meta.title.clone(),
            artist: self.meta.artist.clone(),
            album: self.meta.album.clone(),
            cover_url: self.meta.cover_url.clone(),
            duration: self.meta.duration,
            source_url: self.meta.source_url.clone(),
        })
        .clone()
    }

    pub fn card_loaded(&self) -> bool {
        self.shared.card.lock().is_some()
    }

    /// Actualiza la tarjeta con datos que un backend descubrió tarde
    /// (título real, duración, carátula del extractor).
    pub fn enrich_card(&self, apply: impl FnOnce(&mut NowPlayingCard)) {
        let mut guard = self.shared.card.lock();
        let card = guard.get_or_insert_with(|| NowPlayingCard {
            title: self.meta.title.clone(),
            artist: self.meta.artist.clone(),
            album: self.meta.album.clone(),
            cover_url: self.meta.cover_url.clone(),
            duration: self.meta.duration,
            source_url: self.meta.source_url.clone(),
        });
        apply(card);
    }

    /// Materializa un stream reproducible a través de la cadena de
    /// backends, reutilizando el slot compartido cuando se puede.
    ///
    /// Reglas de reutilización: los archivos locales se devuelven tal cual;
    /// un stream vivo posicionable se rebobina y se reutiliza; cualquier
    /// otro stream vivo (URL de un solo uso ya consumida) se descarta y se
    /// regenera.
    pub async fn load_stream(&self, backends: &BackendSet) -> Result<LoadedStream, BackendError> {
        let mut slot = self.shared.slot.lock().await;

        if let Some(existing) = slot.take() {
            if existing.is_file() {
                let out = existing.clone();
                *slot = Some(existing);
                return Ok(out);
            }
            if !existing.single_use {
                match &existing.body {
                    StreamBody::Media(media) if media.is_seekable() => {
                        if media.seek(0).await.is_ok() {
                            let out = existing.clone();
                            *slot = Some(existing);
                            return Ok(out);
                        }
                    }
                    StreamBody::Http { .. } => {
                        let out = existing.clone();
                        *slot = Some(existing);
                        return Ok(out);
                    }
                    _ => {}
                }
            }
            debug!("Stream vivo no reutilizable para {}, regenerando", self);
        }

        let loaded = backends.resolve(self).await?;
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    /// Guarda directamente un stream resuelto (lo usan los tests y la
    /// canalización de caché al completar una descarga).
    pub async fn set_stream(&self, loaded: LoadedStream) {
        *self.shared.slot.lock().await = Some(loaded);
    }

    /// Libera el stream de red. Los archivos de caché sobreviven entre
    /// reproducciones; con `clear` la pista queda inerte (también pierde
    /// su generador) y solo se usa al destruir la sesión.
    pub async fn close_stream(&self, clear: bool) {
        let mut slot = self.shared.slot.lock().await;
        if let Some(existing) = slot.take() {
            if existing.is_file() && !clear {
                *slot = Some(existing);
            }
        }
        if clear {
            self.shared.generator.lock().take();
        }
    }

    /// Si el slot apunta a un archivo local completo.
    pub async fn is_file_backed(&self) -> bool {
        matches!(
            self.shared.slot.lock().await.as_ref(),
            Some(ls) if ls.is_file()
        )
    }

    pub async fn has_stream(&self) -> bool {
        self.shared.slot.lock().await.is_some()
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.artist() {
            Some(artist) => write!(f, "{}: \"{} - {}\"", self.id(), artist, self.title()),
            None => write!(f, "{}: \"{}\"", self.id(), self.title()),
        }
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("service", &self.meta.service)
            .field("id", &self.meta.id)
            .field("title", &self.meta.title)
            .field("entry_id", &self.entry_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendSet, StreamBody};
    use reqwest::header::HeaderMap;

    fn loaded_file(path: &str) -> LoadedStream {
        LoadedStream {
            backend: BackendKind::Premium,
            native_id: "t-1".into(),
            container: "mp3".into(),
            single_use: false,
            body: StreamBody::File(path.into()),
        }
    }

    fn loaded_http() -> LoadedStream {
        LoadedStream {
            backend: BackendKind::Extractor,
            native_id: "t-1".into(),
            container: "webm".into(),
            single_use: false,
            body: StreamBody::Http {
                url: "http://localhost/a".into(),
                headers: HeaderMap::new(),
                content_length: None,
            },
        }
    }

    #[test]
    fn test_builders_y_getters() {
        let track = Track::new(BackendKind::Premium, "42", "Canción")
            .with_artist("Artista")
            .with_album("Disco")
            .with_duration(Duration::from_secs(215))
            .with_isrc("USRC17607839")
            .with_generator(StreamGenerator {
                track_id: "42".into(),
                quality: "high".into(),
            });

        assert_eq!(track.id(), "42");
        assert_eq!(track.artist(), Some("Artista"));
        assert_eq!(track.isrc(), Some("USRC17607839"));
        assert_eq!(
            track.generator(),
            Some(StreamGenerator {
                track_id: "42".into(),
                quality: "high".into(),
            })
        );
        assert_eq!(format!("{track}"), "42: \"Artista - Canción\"");
    }

    #[test]
    fn test_copias_comparten_estado_pero_no_entry_id() {
        let mut a = Track::new(BackendKind::Premium, "7", "Tema");
        a.assign_entry(10);
        let mut b = a.clone();
        b.assign_entry(11);

        assert_eq!(a.entry_id(), 10);
        assert_eq!(b.entry_id(), 11);

        // La tarjeta es compartida.
        a.enrich_card(|c| c.title = "Tema (en vivo)".into());
        assert_eq!(b.card().title, "Tema (en vivo)");
    }

    #[tokio::test]
    async fn test_archivo_local_se_sirve_sin_backends() {
        let track = Track::new(BackendKind::Premium, "9", "Local");
        track.set_stream(loaded_file("/tmp/cancion.mp3")).await;

        // Cadena vacía: si tocara la red, fallaría.
        let empty = BackendSet::new(Vec::new());
        let loaded = track.load_stream(&empty).await.unwrap();
        assert!(loaded.is_file());
    }

    #[tokio::test]
    async fn test_close_stream_conserva_archivos_y_suelta_remotos() {
        let track = Track::new(BackendKind::Premium, "9", "Local");

        track.set_stream(loaded_file("/tmp/cancion.mp3")).await;
        track.close_stream(false).await;
        assert!(track.is_file_backed().await);

        track.set_stream(loaded_http()).await;
        track.close_stream(false).await;
        assert!(!track.has_stream().await);
    }

    #[tokio::test]
    async fn test_close_stream_con_clear_deja_la_pista_inerte() {
        let track = Track::new(BackendKind::Premium, "9", "Local").with_generator(StreamGenerator {
            track_id: "9".into(),
            quality: "high".into(),
        });
        track.set_stream(loaded_file("/tmp/cancion.mp3")).await;

        track.close_stream(true).await;
        assert!(!track.has_stream().await);
        assert_eq!(track.generator(), None);
    }

    #[tokio::test]
    async fn test_stream_http_se_reutiliza() {
        let track = Track::new(BackendKind::Extractor, "x", "Directo");
        track.set_stream(loaded_http()).await;

        let empty = BackendSet::new(Vec::new());
        let loaded = track.load_stream(&empty).await.unwrap();
        assert!(matches!(loaded.body, StreamBody::Http { .. }));
    }

    #[tokio::test]
    async fn test_stream_de_un_solo_uso_no_se_reutiliza() {
        let track = Track::new(BackendKind::Premium, "x", "Firmada");
        let mut loaded = loaded_http();
        loaded.single_use = true;
        track.set_stream(loaded).await;

        // Una URL firmada ya consumida obliga a regenerar; con la cadena
        // vacía la resolución tiene que fallar en vez de reutilizar.
        let empty = BackendSet::new(Vec::new());
        assert!(track.load_stream(&empty).await.is_err());
    }

    #[test]
    fn test_tarjeta_se_materializa_una_vez() {
        let track = Track::new(BackendKind::Extractor, "v", "Video").with_artist("Canal");
        assert!(!track.card_loaded());

        let card = track.card();
        assert_eq!(card.title, "Video");
        assert_eq!(card.artist.as_deref(), Some("Canal"));
        assert!(track.card_loaded());
    }
}
