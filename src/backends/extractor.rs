use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_process::Command;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

use super::{BackendError, BackendKind, LoadedStream, StreamBackend, StreamBody};
use crate::track::Track;

/// Extractor genérico sobre yt-dlp: el último eslabón de la cadena.
///
/// Sirve cualquier pista con URL de origen y, para pistas de catálogo que
/// los otros backends rechazaron, cae a una búsqueda por artista y título.
pub struct ExtractorBackend {
    /// Sondas memoizadas por pista: seek y prefetch concurrentes esperan
    /// la misma extracción en vuelo en lugar de lanzar otro proceso.
    probes: DashMap<String, Arc<OnceCell<Arc<ProbeInfo>>>>,
    /// Limita procesos yt-dlp simultáneos.
    permits: Semaphore,
}

/// Información extraída de yt-dlp para el mejor formato de audio.
#[derive(Debug, Deserialize)]
pub struct ProbeInfo {
    pub id: String,
    pub title: String,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<f64>,
    pub http_headers: Option<HashMap<String, String>>,
    pub is_live: Option<bool>,
}

impl ExtractorBackend {
    pub fn new() -> Self {
        Self {
            probes: DashMap::new(),
            permits: Semaphore::new(3),
        }
    }

    /// Objetivo que recibe yt-dlp: la URL de origen, o una búsqueda por
    /// metadatos cuando la pista vino de otro catálogo.
    fn probe_target(track: &Track) -> String {
        if let Some(url) = track.source_url() {
            if url.starts_with("http://") || url.starts_with("https://") {
                return url.to_string();
            }
        }
        match track.artist() {
            Some(artist) => format!("ytsearch1:{} {}", artist, track.title()),
            None => format!("ytsearch1:{}", track.title()),
        }
    }

    async fn memoized_probe(&self, track: &Track) -> Result<Arc<ProbeInfo>, BackendError> {
        let key = format!("{}:{}", track.service(), track.id());
        let cell = self
            .probes
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let target = Self::probe_target(track);
        cell.get_or_try_init(|| async { self.run_probe(&target).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Ejecuta yt-dlp y parsea su JSON de volcado.
    async fn run_probe(&self, target: &str) -> Result<ProbeInfo, BackendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| BackendError::Process(e.to_string()))?;

        debug!("📊 Sondeando con yt-dlp: {}", target);

        let output = Command::new("yt-dlp")
            .args([
                "--no-playlist",
                "--dump-json",
                "--no-warnings",
                "-f",
                "bestaudio/best",
                "--socket-timeout",
                "30",
                "--retries",
                "3",
                target,
            ])
            .output()
            .await
            .map_err(|e| BackendError::Process(format!("no se pudo lanzar yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let brief: String = stderr.trim().chars().take(300).collect();
            return Err(BackendError::Process(format!("yt-dlp falló: {brief}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| l.trim_start().starts_with('{'))
            .ok_or_else(|| BackendError::Process("yt-dlp no devolvió JSON".into()))?;

        serde_json::from_str(line)
            .map_err(|e| BackendError::Process(format!("JSON de yt-dlp inválido: {e}")))
    }

    /// Comprueba que el binario exista; se usa desde el health check.
    pub async fn verify_binary() -> Result<String, BackendError> {
        let output = Command::new("yt-dlp")
            .arg("--version")
            .output()
            .await
            .map_err(|e| BackendError::Process(format!("yt-dlp no disponible: {e}")))?;

        if !output.status.success() {
            return Err(BackendError::Process("yt-dlp no disponible".into()));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("✅ yt-dlp versión: {}", version);
        Ok(version)
    }
}

impl Default for ExtractorBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Convierte las cabeceras que exige el formato elegido (User-Agent,
/// Referer...) descartando las que no se puedan representar.
fn headers_from_probe(probe: &ProbeInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(map) = &probe.http_headers {
        for (name, value) in map {
            let Ok(name) = name.parse::<HeaderName>() else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            headers.insert(name, value);
        }
    }
    headers
}

fn content_length(probe: &ProbeInfo) -> Option<u64> {
    probe
        .filesize
        .or_else(|| probe.filesize_approx.map(|f| f as u64))
}

#[async_trait]
impl StreamBackend for ExtractorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Extractor
    }

    // Último recurso: siempre hay un objetivo que sondear.
    fn can_serve(&self, _track: &Track) -> bool {
        true
    }

    async fn open(&self, track: &Track) -> Result<LoadedStream, BackendError> {
        let probe = self.memoized_probe(track).await?;

        if probe.is_live.unwrap_or(false) {
            return Err(BackendError::Unavailable(
                "los streams en vivo no se pueden encolar".into(),
            ));
        }

        let Some(url) = probe.url.clone() else {
            return Err(BackendError::Unavailable(
                "el extractor no entregó URL de stream".into(),
            ));
        };

        // Las pistas nacidas en el extractor no traen metadatos hasta que
        // la sonda los descubre.
        if track.service() == BackendKind::Extractor {
            let probe = probe.clone();
            track.enrich_card(move |card| {
                card.title = probe.title.clone();
                if card.artist.is_none() {
                    card.artist = probe.uploader.clone();
                }
                if card.cover_url.is_none() {
                    card.cover_url = probe.thumbnail.clone();
                }
                if card.duration.is_none() {
                    card.duration = probe.duration.map(Duration::from_secs_f64);
                }
                if card.source_url.is_none() {
                    card.source_url = probe.webpage_url.clone();
                }
            });
        }

        if content_length(&probe).is_none() {
            warn!("⚠️ Formato sin tamaño declarado para {}", track);
        }

        Ok(LoadedStream {
            backend: BackendKind::Extractor,
            native_id: probe.id.clone(),
            container: probe.ext.clone().unwrap_or_else(|| "webm".into()),
            single_use: false,
            body: StreamBody::Http {
                url,
                headers: headers_from_probe(&probe),
                content_length: content_length(&probe),
            },
        })
    }
}
