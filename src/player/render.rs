use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::GuildId;
use songbird::input::{AudioStream, File as FileInput, HttpRequest, Input, LiveInput};
use songbird::tracks::TrackHandle;
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::backends::{LoadedStream, StreamBody};
use crate::track::stream::StreamReader;

/// Efecto de convolución declarativo. El sink decide cómo (y si) lo
/// aplica; el motor solo lo transporta junto al volumen.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionEffect {
    pub dry_gain: f32,
    pub wet_gain: f32,
    /// Respuestas al impulso izquierda/derecha.
    pub impulse_response: (PathBuf, PathBuf),
}

impl ConvolutionEffect {
    pub fn describe(&self) -> String {
        format!(
            "dry {:.2} / wet {:.2} ({})",
            self.dry_gain,
            self.wet_gain,
            self.impulse_response.0.display()
        )
    }
}

/// Bolsa de opciones que acompaña a cada arranque de render.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub volume: f32,
    pub effect: Option<ConvolutionEffect>,
    pub start_offset: Duration,
}

/// Aviso de fin de render: `None` es un final normal (o un stop), un
/// `Some` lleva el detalle de un error real del pipeline.
pub type EndNotifier = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Control sobre un render en curso.
pub trait RenderHandle: Send + Sync {
    fn stop(&self);
    fn pause(&self);
    fn resume(&self);
    fn set_volume(&self, volume: f32);
}

/// Destino de render: encola bytes de audio en la conexión de voz y
/// avisa una única vez cuando el render termina.
#[async_trait]
pub trait RenderSink: Send + Sync {
    async fn start(
        &self,
        guild: GuildId,
        stream: &LoadedStream,
        opts: RenderOptions,
        on_end: EndNotifier,
    ) -> Result<Box<dyn RenderHandle>>;

    /// Si la guild sigue teniendo una conexión de voz viva.
    fn is_connected(&self, guild: GuildId) -> bool;
}

/// Implementación real sobre el driver de songbird.
///
/// Los archivos y URLs directas van por los inputs perezosos de
/// songbird; los streams por chunks (desencriptador, cola de caché) se
/// puentean con [`StreamReader`] como `MediaSource` crudo para que el
/// probe de symphonia los identifique.
pub struct SongbirdSink {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    rt: Handle,
}

impl SongbirdSink {
    pub fn new(manager: Arc<Songbird>, http: reqwest::Client, rt: Handle) -> Self {
        Self { manager, http, rt }
    }

    fn build_input(&self, stream: &LoadedStream) -> Input {
        match &stream.body {
            StreamBody::File(path) => FileInput::new(path.clone()).into(),
            StreamBody::Http { url, headers, .. } => {
                HttpRequest::new_with_headers(self.http.clone(), url.clone(), headers.clone())
                    .into()
            }
            StreamBody::Media(media) => {
                let reader = StreamReader::new(media.clone(), self.rt.clone());
                let mut hint = Hint::new();
                hint.with_extension(
                    &media
                        .container_hint()
                        .unwrap_or_else(|| stream.container.clone()),
                );
                Input::Live(
                    LiveInput::Raw(AudioStream {
                        input: Box::new(reader) as Box<dyn MediaSource>,
                        hint: Some(hint),
                    }),
                    None,
                )
            }
        }
    }
}

#[async_trait]
impl RenderSink for SongbirdSink {
    async fn start(
        &self,
        guild: GuildId,
        stream: &LoadedStream,
        opts: RenderOptions,
        on_end: EndNotifier,
    ) -> Result<Box<dyn RenderHandle>> {
        let call = self
            .manager
            .get(guild)
            .ok_or_else(|| anyhow::anyhow!("sin conexión de voz para la guild {guild}"))?;

        let input = self.build_input(stream);
        let handle = {
            let mut call = call.lock().await;
            call.play_input(input)
        };

        let _ = handle.set_volume(opts.volume.clamp(0.0, 2.0));
        if let Some(effect) = &opts.effect {
            debug!("🎛️ Efecto de convolución activo: {}", effect.describe());
        }
        if !opts.start_offset.is_zero() {
            // Búsqueda best-effort sobre la pista recién lanzada; si el
            // contenedor no la soporta, la reproducción sigue desde cero.
            let _ = handle.seek(opts.start_offset);
        }

        // End y Error comparten el cerrojo: el aviso sale una sola vez
        // aunque el driver emita ambos eventos.
        let fired = Arc::new(AtomicBool::new(false));
        handle
            .add_event(
                Event::Track(TrackEvent::End),
                RenderDone {
                    on_end: on_end.clone(),
                    fired: fired.clone(),
                    failed: false,
                },
            )
            .map_err(|e| anyhow::anyhow!("no se pudo registrar el evento de fin: {e}"))?;
        handle
            .add_event(
                Event::Track(TrackEvent::Error),
                RenderDone {
                    on_end,
                    fired,
                    failed: true,
                },
            )
            .map_err(|e| anyhow::anyhow!("no se pudo registrar el evento de error: {e}"))?;

        Ok(Box::new(SongbirdHandle { inner: handle }))
    }

    fn is_connected(&self, guild: GuildId) -> bool {
        self.manager.get(guild).is_some()
    }
}

struct SongbirdHandle {
    inner: TrackHandle,
}

impl RenderHandle for SongbirdHandle {
    fn stop(&self) {
        let _ = self.inner.stop();
    }

    fn pause(&self) {
        let _ = self.inner.pause();
    }

    fn resume(&self) {
        let _ = self.inner.play();
    }

    fn set_volume(&self, volume: f32) {
        let _ = self.inner.set_volume(volume.clamp(0.0, 2.0));
    }
}

/// Traduce los eventos de pista del driver al aviso único del motor.
struct RenderDone {
    on_end: EndNotifier,
    fired: Arc<AtomicBool>,
    failed: bool,
}

#[async_trait]
impl VoiceEventHandler for RenderDone {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = if self.failed {
            let detail = match ctx {
                EventContext::Track(list) => list
                    .first()
                    .map(|(state, _)| format!("estado de la pista: {:?}", state.playing)),
                _ => None,
            };
            let detail = detail.unwrap_or_else(|| "sin detalle del driver".into());
            warn!("⚠️ El driver reportó un error de render: {}", detail);
            Some(detail)
        } else {
            None
        };

        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.on_end)(error);
        }
        Some(Event::Cancel)
    }
}
