use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{BackendError, BackendKind, LoadedStream, StreamBackend, StreamBody};
use crate::cache::{CacheStore, CacheWriter};
use crate::track::{StreamGenerator, Track};

/// Backend del catálogo de suscripción.
///
/// Las URLs que firma la API caducan y se consumen en una sola lectura,
/// así que cada reinicio de reproducción pide una nueva. Con la caché
/// agresiva activada, la primera reproducción descarga en segundo plano
/// y el render lee la cola del archivo en crecimiento; las siguientes
/// salen directamente del disco.
pub struct PremiumBackend {
    client: reqwest::Client,
    api_base: String,
    token: String,
    quality: String,
    cache: Arc<CacheStore>,
    aggressive_cache: bool,
}

/// Respuesta de la API al pedir un stream firmado.
#[derive(Debug, Deserialize)]
struct StreamTicket {
    url: String,
    size: Option<u64>,
}

/// Contenedor que entrega la API para cada calidad.
fn container_for(quality: &str) -> &'static str {
    if quality.eq_ignore_ascii_case("lossless") || quality.eq_ignore_ascii_case("flac") {
        "flac"
    } else {
        "mp3"
    }
}

impl PremiumBackend {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        token: impl Into<String>,
        quality: impl Into<String>,
        cache: Arc<CacheStore>,
        aggressive_cache: bool,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            token: token.into(),
            quality: quality.into(),
            cache,
            aggressive_cache,
        }
    }

    fn generator_for(&self, track: &Track) -> StreamGenerator {
        track.generator().unwrap_or_else(|| StreamGenerator {
            track_id: track.id().to_string(),
            quality: self.quality.clone(),
        })
    }

    async fn request_ticket(&self, generator: &StreamGenerator) -> Result<StreamTicket, BackendError> {
        let url = format!(
            "{}/v1/track/{}/stream",
            self.api_base.trim_end_matches('/'),
            generator.track_id
        );

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("quality", generator.quality.as_str())])
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::NotFound(format!(
                    "pista {} no está en el catálogo",
                    generator.track_id
                )))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BackendError::Unavailable("la API rechazó el token".into()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(BackendError::Unavailable("cuota de streams agotada".into()))
            }
            s => return Err(BackendError::Network(format!("la API respondió {s}"))),
        }

        resp.json::<StreamTicket>()
            .await
            .map_err(|e| BackendError::Network(format!("ticket ilegible: {e}")))
    }

    /// Arranca la descarga a caché y devuelve un lector de cola sobre el
    /// archivo en crecimiento. Espera a los primeros bytes para que un
    /// fallo inmediato (URL firmada caducada) se vea en la resolución.
    ///
    /// `None` significa que la caché no estaba disponible y el ticket
    /// sigue sin consumir: el llamador puede usarlo en directo.
    async fn stream_through_cache(
        &self,
        ticket: &StreamTicket,
        native_id: &str,
        ext: &str,
        label: String,
    ) -> Result<Option<LoadedStream>, BackendError> {
        let writer = match self.cache.begin("premium", native_id, ext, ticket.size) {
            Ok(w) => w,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Otra sesión ya la está bajando: colgarse de su cola.
                if let Some(tail) = self.cache.tail_pending("premium", native_id, ext) {
                    return Ok(Some(LoadedStream {
                        backend: BackendKind::Premium,
                        native_id: native_id.to_string(),
                        container: ext.to_string(),
                        single_use: false,
                        body: StreamBody::Media(Arc::new(tail)),
                    }));
                }
                return Ok(self
                    .cache
                    .lookup("premium", native_id, ext)
                    .map(|path| LoadedStream {
                        backend: BackendKind::Premium,
                        native_id: native_id.to_string(),
                        container: ext.to_string(),
                        single_use: false,
                        body: StreamBody::File(path),
                    }));
            }
            Err(e) => {
                warn!("⚠️ No se pudo abrir la caché para {}: {}", label, e);
                return Ok(None);
            }
        };

        let tail = match writer.tail_reader(ext) {
            Ok(t) => t,
            Err(e) => {
                warn!("⚠️ Sin lector de cola para {}: {}", label, e);
                return Ok(None);
            }
        };
        let entry = writer.entry();

        tokio::spawn(download_to_cache(
            self.client.clone(),
            ticket.url.clone(),
            writer,
            label,
        ));

        entry.wait_past(0).await;
        if entry.is_failed() {
            return Err(BackendError::Unavailable(
                "la descarga del stream firmado no arrancó".into(),
            ));
        }

        Ok(Some(LoadedStream {
            backend: BackendKind::Premium,
            native_id: native_id.to_string(),
            container: ext.to_string(),
            single_use: false,
            body: StreamBody::Media(Arc::new(tail)),
        }))
    }
}

async fn download_to_cache(
    client: reqwest::Client,
    url: String,
    mut writer: CacheWriter,
    label: String,
) {
    let run = async move {
        let mut resp = client.get(&url).send().await?.error_for_status()?;
        while let Some(chunk) = resp.chunk().await? {
            writer.write_chunk(&chunk).await?;
        }
        let dest = writer.finish().await?;
        anyhow::Ok(dest)
    };

    match run.await {
        Ok(dest) => info!("💾 Caché sellada para {}: {}", label, dest.display()),
        Err(e) => warn!("⚠️ Descarga a caché fallida para {}: {}", label, e),
    }
}

#[async_trait]
impl StreamBackend for PremiumBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Premium
    }

    fn can_serve(&self, track: &Track) -> bool {
        track.service() == BackendKind::Premium || track.generator().is_some()
    }

    async fn open(&self, track: &Track) -> Result<LoadedStream, BackendError> {
        let generator = self.generator_for(track);
        let native_id = generator.track_id.clone();
        let ext = container_for(&generator.quality);

        if let Some(path) = self.cache.lookup("premium", &native_id, ext) {
            info!("💾 Sirviendo {} desde caché", track);
            return Ok(LoadedStream {
                backend: BackendKind::Premium,
                native_id,
                container: ext.to_string(),
                single_use: false,
                body: StreamBody::File(path),
            });
        }

        if let Some(tail) = self.cache.tail_pending("premium", &native_id, ext) {
            debug!("💾 Descarga en curso para {}, leyendo la cola", track);
            return Ok(LoadedStream {
                backend: BackendKind::Premium,
                native_id,
                container: ext.to_string(),
                single_use: false,
                body: StreamBody::Media(Arc::new(tail)),
            });
        }

        let ticket = self.request_ticket(&generator).await?;
        if track.generator().is_none() {
            track.attach_generator(generator.clone());
        }

        if self.aggressive_cache {
            if let Some(loaded) = self
                .stream_through_cache(&ticket, &native_id, ext, track.to_string())
                .await?
            {
                return Ok(loaded);
            }
        }

        Ok(direct_stream(native_id, ext, ticket))
    }
}

fn direct_stream(native_id: String, ext: &str, ticket: StreamTicket) -> LoadedStream {
    LoadedStream {
        backend: BackendKind::Premium,
        native_id,
        container: ext.to_string(),
        single_use: true,
        body: StreamBody::Http {
            url: ticket.url,
            headers: HeaderMap::new(),
            content_length: ticket.size,
        },
    }
}
