use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::track::stream::MediaStream;
use crate::track::Track;

pub mod decryptor;
pub mod extractor;
pub mod hifi;
pub mod premium;

pub use extractor::ExtractorBackend;
pub use hifi::HiFiBackend;
pub use premium::PremiumBackend;

/// Identifica cada servicio de streaming soportado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Servicio lossless con streams encriptados por chunks.
    HiFi,
    /// Catálogo premium con URLs firmadas de un solo uso.
    Premium,
    /// Extractor genérico (yt-dlp) como último recurso.
    Extractor,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HiFi => "hifi",
            Self::Premium => "premium",
            Self::Extractor => "extractor",
        }
    }

    /// Interpreta un nombre de backend tal como aparece en la configuración.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "hifi" => Some(Self::HiFi),
            "premium" => Some(Self::Premium),
            "extractor" => Some(Self::Extractor),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallos de resolución de streams. Todos disparan el paso al siguiente
/// backend de la cadena; la variante decide el mensaje y el log.
#[derive(Debug, Error)]
pub enum BackendError {
    /// El backend no tiene la pista (lookup sin resultado, sin match de ISRC).
    #[error("pista no encontrada: {0}")]
    NotFound(String),
    /// La pista existe pero no se puede servir: cuota, DRM, lista negra,
    /// URL firmada vencida o reintentos de red agotados.
    #[error("pista no disponible: {0}")]
    Unavailable(String),
    /// Fallo de red transitorio que agotó sus reintentos.
    #[error("error de red: {0}")]
    Network(String),
    /// El chunk no se pudo desencriptar con la clave recibida.
    #[error("descifrado fallido: {0}")]
    Decrypt(String),
    /// Un proceso externo (yt-dlp) terminó mal o devolvió basura.
    #[error("proceso externo falló: {0}")]
    Process(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_status() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl std::fmt::Debug for LoadedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedStream")
            .field("backend", &self.backend)
            .field("native_id", &self.native_id)
            .field("container", &self.container)
            .field("single_use", &self.single_use)
            .finish_non_exhaustive()
    }
}

/// Stream resuelto, listo para el pipeline de render y para la caché.
#[derive(Clone)]
pub struct LoadedStream {
    /// Backend que terminó sirviendo los bytes.
    pub backend: BackendKind,
    /// Identificador nativo de la pista en ese backend.
    pub native_id: String,
    /// Extensión del contenedor ("mp3", "flac", "webm"...).
    pub container: String,
    /// Las URLs firmadas de un solo uso no sobreviven a un reinicio de
    /// reproducción: hay que regenerarlas en cada intento.
    pub single_use: bool,
    pub body: StreamBody,
}

#[derive(Clone)]
pub enum StreamBody {
    /// Archivo local completo.
    File(PathBuf),
    /// Stream remoto leído por chunks (desencriptado, o cola de caché).
    Media(Arc<dyn MediaStream>),
    /// URL directa apta para lectura HTTP con rangos.
    Http {
        url: String,
        headers: HeaderMap,
        content_length: Option<u64>,
    },
}

impl LoadedStream {
    pub fn is_file(&self) -> bool {
        matches!(self.body, StreamBody::File(_))
    }

    /// Descripción corta para logs.
    pub fn describe(&self) -> String {
        let body = match &self.body {
            StreamBody::File(p) => format!("archivo {}", p.display()),
            StreamBody::Media(_) => "stream por chunks".to_string(),
            StreamBody::Http { .. } => "http directo".to_string(),
        };
        format!("{} via {}", body, self.backend)
    }
}

/// Estrategia de resolución de streams de un servicio concreto.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Si el backend puede siquiera intentar servir esta pista.
    fn can_serve(&self, track: &Track) -> bool;

    /// Resuelve un stream reproducible para la pista.
    async fn open(&self, track: &Track) -> Result<LoadedStream, BackendError>;
}

/// Cadena de backends en orden de prioridad configurado.
pub struct BackendSet {
    backends: Vec<Arc<dyn StreamBackend>>,
}

impl BackendSet {
    pub fn new(backends: Vec<Arc<dyn StreamBackend>>) -> Self {
        Self { backends }
    }

    /// Reordena los backends disponibles según la prioridad configurada.
    /// Backends no mencionados en el orden quedan fuera de la cadena.
    pub fn ordered(order: &[BackendKind], available: Vec<Arc<dyn StreamBackend>>) -> Self {
        let mut backends = Vec::with_capacity(order.len());
        for kind in order {
            if let Some(b) = available.iter().find(|b| b.kind() == *kind) {
                backends.push(b.clone());
            }
        }
        Self { backends }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Recorre la cadena hasta que un backend entrega un stream. Cada fallo
    /// se registra y se pasa al siguiente; si todos fallan se devuelve el
    /// último error.
    pub async fn resolve(&self, track: &Track) -> Result<LoadedStream, BackendError> {
        let mut last_err: Option<BackendError> = None;

        for backend in &self.backends {
            if !backend.can_serve(track) {
                debug!("Backend {} no aplica para {}", backend.kind(), track);
                continue;
            }

            match backend.open(track).await {
                Ok(stream) => {
                    debug!("🎯 {} servida: {}", track, stream.describe());
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("⚠️ Backend {} falló para {}: {}", backend.kind(), track, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| BackendError::NotFound(format!("ningún backend sirve {track}"))))
    }

    /// Comprueba sin abrir streams si alguna parte de la cadena aplica.
    pub fn any_candidate(&self, track: &Track) -> bool {
        self.backends.iter().any(|b| b.can_serve(track))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedBackend {
        kind: BackendKind,
        serves: bool,
        fails: bool,
        calls: AtomicUsize,
    }

    impl FixedBackend {
        fn new(kind: BackendKind, serves: bool, fails: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                serves,
                fails,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamBackend for FixedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn can_serve(&self, _track: &Track) -> bool {
            self.serves
        }

        async fn open(&self, track: &Track) -> Result<LoadedStream, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fails {
                return Err(BackendError::Unavailable("sin cuota".into()));
            }
            Ok(LoadedStream {
                backend: self.kind,
                native_id: track.id().to_string(),
                container: "mp3".into(),
                single_use: false,
                body: StreamBody::Http {
                    url: "http://localhost/audio".into(),
                    headers: HeaderMap::new(),
                    content_length: None,
                },
            })
        }
    }

    fn sample_track() -> Track {
        Track::new(BackendKind::Premium, "t-1", "Prueba")
    }

    #[tokio::test]
    async fn test_resolve_respeta_prioridad() {
        let hifi = FixedBackend::new(BackendKind::HiFi, true, false);
        let premium = FixedBackend::new(BackendKind::Premium, true, false);
        let set = BackendSet::ordered(
            &[BackendKind::Premium, BackendKind::HiFi],
            vec![hifi.clone(), premium.clone()],
        );

        let loaded = set.resolve(&sample_track()).await.unwrap();
        assert_eq!(loaded.backend, BackendKind::Premium);
        assert_eq!(hifi.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_cae_al_siguiente_backend() {
        let hifi = FixedBackend::new(BackendKind::HiFi, true, true);
        let extractor = FixedBackend::new(BackendKind::Extractor, true, false);
        let set = BackendSet::ordered(
            &[BackendKind::HiFi, BackendKind::Extractor],
            vec![hifi.clone(), extractor.clone()],
        );

        let loaded = set.resolve(&sample_track()).await.unwrap();
        assert_eq!(loaded.backend, BackendKind::Extractor);
        assert_eq!(hifi.calls.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_salta_backends_que_no_aplican() {
        let hifi = FixedBackend::new(BackendKind::HiFi, false, false);
        let premium = FixedBackend::new(BackendKind::Premium, true, false);
        let set = BackendSet::ordered(
            &[BackendKind::HiFi, BackendKind::Premium],
            vec![hifi.clone(), premium],
        );

        let loaded = set.resolve(&sample_track()).await.unwrap();
        assert_eq!(loaded.backend, BackendKind::Premium);
        assert_eq!(hifi.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_agotado_devuelve_ultimo_error() {
        let hifi = FixedBackend::new(BackendKind::HiFi, true, true);
        let premium = FixedBackend::new(BackendKind::Premium, true, true);
        let set = BackendSet::ordered(
            &[BackendKind::HiFi, BackendKind::Premium],
            vec![hifi, premium],
        );

        let err = set.resolve(&sample_track()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(BackendKind::parse_name(" HiFi "), Some(BackendKind::HiFi));
        assert_eq!(BackendKind::parse_name("premium"), Some(BackendKind::Premium));
        assert_eq!(BackendKind::parse_name("desconocido"), None);
    }
}
