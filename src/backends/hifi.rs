use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::decryptor::{ChunkedDecryptor, HttpChunkFetcher, UrlRenewer};
use super::{BackendError, BackendKind, LoadedStream, StreamBackend, StreamBody};
use crate::cache::CacheStore;
use crate::track::Track;

/// Cuánto tiempo una pista fallida cortocircuita nuevos intentos.
const BLACKLIST_TTL: Duration = Duration::from_secs(30 * 60);

/// Backend sin pérdida. Traduce el ISRC de la pista a su id nativo, pide
/// una URL firmada con su clave de desencriptado por pista y sirve un
/// stream desencriptado por chunks.
///
/// Los fallos de derechos son persistentes dentro de una escucha (sin
/// matching, sin suscripción, token vencido), así que se anotan en una
/// lista negra con TTL y los reintentos devuelven `Unavailable` sin
/// tocar la red.
pub struct HiFiBackend {
    client: reqwest::Client,
    api_base: String,
    token: String,
    fetcher: Arc<HttpChunkFetcher>,
    cache: Arc<CacheStore>,
    blacklist: DashMap<String, Instant>,
    isrc_map: DashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct IsrcMatch {
    id: String,
}

/// URL firmada + material de clave que entrega la API. La clave llega en
/// base64 y nunca se deriva localmente.
#[derive(Debug, Deserialize)]
struct PlaybackTicket {
    url: String,
    key: String,
    container: Option<String>,
    size: Option<u64>,
}

async fn fetch_ticket(
    client: &reqwest::Client,
    api_base: &str,
    token: &str,
    native_id: &str,
) -> Result<PlaybackTicket, BackendError> {
    let url = format!(
        "{}/v1/tracks/{}/playback",
        api_base.trim_end_matches('/'),
        urlencoding::encode(native_id)
    );

    let resp = client
        .get(&url)
        .bearer_auth(token)
        .query(&[("quality", "lossless")])
        .send()
        .await?;

    match resp.status() {
        s if s.is_success() => {}
        StatusCode::NOT_FOUND => {
            return Err(BackendError::NotFound(format!(
                "pista {native_id} sin stream sin pérdida"
            )))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(BackendError::Unavailable(
                "sin derechos de reproducción".into(),
            ))
        }
        s => return Err(BackendError::Network(format!("la API respondió {s}"))),
    }

    resp.json::<PlaybackTicket>()
        .await
        .map_err(|e| BackendError::Network(format!("ticket ilegible: {e}")))
}

/// Renovador que el decryptor invoca si la URL firmada vence antes de
/// entregar su primer chunk.
struct TicketRenewer {
    client: reqwest::Client,
    api_base: String,
    token: String,
    native_id: String,
}

#[async_trait]
impl UrlRenewer for TicketRenewer {
    async fn renew(&self) -> Result<String, BackendError> {
        debug!("🔄 Renovando URL firmada para {}", self.native_id);
        let ticket = fetch_ticket(&self.client, &self.api_base, &self.token, &self.native_id).await?;
        Ok(ticket.url)
    }
}

impl HiFiBackend {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        token: impl Into<String>,
        cache: Arc<CacheStore>,
    ) -> Self {
        Self {
            fetcher: Arc::new(HttpChunkFetcher::new(client.clone())),
            client,
            api_base: api_base.into(),
            token: token.into(),
            cache,
            blacklist: DashMap::new(),
            isrc_map: DashMap::new(),
        }
    }

    fn is_blacklisted(&self, id: &str) -> bool {
        if let Some(when) = self.blacklist.get(id) {
            if when.elapsed() < BLACKLIST_TTL {
                return true;
            }
        }
        self.blacklist.remove(id);
        false
    }

    fn blacklist(&self, id: &str) {
        self.blacklist.insert(id.to_string(), Instant::now());
    }

    /// Id nativo del servicio: directo para pistas propias, vía ISRC para
    /// las que vienen de otro catálogo.
    async fn resolve_native_id(&self, track: &Track) -> Result<String, BackendError> {
        if track.service() == BackendKind::HiFi {
            return Ok(track.id().to_string());
        }

        let isrc = track.isrc().ok_or_else(|| {
            BackendError::NotFound("la pista no trae ISRC".into())
        })?;

        if let Some(hit) = self.isrc_map.get(isrc) {
            return Ok(hit.clone());
        }

        let url = format!(
            "{}/v1/tracks/isrc/{}",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(isrc)
        );
        let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::NotFound(format!(
                    "sin equivalencia para ISRC {isrc}"
                )))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BackendError::Unavailable("la API rechazó el token".into()))
            }
            s => return Err(BackendError::Network(format!("la API respondió {s}"))),
        }

        let matched = resp
            .json::<IsrcMatch>()
            .await
            .map_err(|e| BackendError::Network(format!("respuesta ilegible: {e}")))?;

        self.isrc_map.insert(isrc.to_string(), matched.id.clone());
        Ok(matched.id)
    }

    async fn open_inner(&self, track: &Track) -> Result<LoadedStream, BackendError> {
        let native_id = self.resolve_native_id(track).await?;

        // Audio ya desencriptado en disco por la canalización de caché. El
        // contenedor lo decide el ticket, así que la búsqueda no lo fija.
        if let Some((path, container)) = self.cache.lookup_any("hifi", &native_id) {
            info!("💾 Sirviendo {} desde caché sin pérdida", track);
            return Ok(LoadedStream {
                backend: BackendKind::HiFi,
                native_id,
                container,
                single_use: false,
                body: StreamBody::File(path),
            });
        }

        let ticket = fetch_ticket(&self.client, &self.api_base, &self.token, &native_id).await?;

        let key = BASE64
            .decode(&ticket.key)
            .map_err(|e| BackendError::Decrypt(format!("clave no es base64: {e}")))?;
        if key.is_empty() {
            return Err(BackendError::Decrypt("clave de pista vacía".into()));
        }

        let container = ticket.container.unwrap_or_else(|| "flac".into());
        let renewer = Arc::new(TicketRenewer {
            client: self.client.clone(),
            api_base: self.api_base.clone(),
            token: self.token.clone(),
            native_id: native_id.clone(),
        });

        let decryptor = ChunkedDecryptor::new(
            ticket.url,
            key,
            container.clone(),
            self.fetcher.clone(),
            Some(renewer),
        );
        if let Some(size) = ticket.size {
            decryptor.set_total_hint(size);
        }

        // Que la URL muerta se note aquí y no a mitad de reproducción.
        decryptor.prime().await?;

        Ok(LoadedStream {
            backend: BackendKind::HiFi,
            native_id,
            container,
            single_use: false,
            body: StreamBody::Media(Arc::new(decryptor)),
        })
    }
}

#[async_trait]
impl StreamBackend for HiFiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HiFi
    }

    fn can_serve(&self, track: &Track) -> bool {
        track.service() == BackendKind::HiFi || track.isrc().is_some()
    }

    async fn open(&self, track: &Track) -> Result<LoadedStream, BackendError> {
        if self.is_blacklisted(track.id()) {
            return Err(BackendError::Unavailable(
                "pista en lista negra tras fallos previos".into(),
            ));
        }

        match self.open_inner(track).await {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                warn!("⚠️ Sin stream sin pérdida para {}: {}", track, e);
                self.blacklist(track.id());
                Err(e)
            }
        }
    }
}
