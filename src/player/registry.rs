use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use serenity::client::Context;
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::Songbird;
use tracing::{debug, info, warn};

use crate::backends::BackendSet;
use crate::cache::CacheStore;
use crate::player::announce::ChannelAnnouncer;
use crate::player::render::RenderSink;
use crate::player::session::{PlaybackSession, SessionConfig};

/// Registro de sesiones por guild.
///
/// Es el único dueño del mapa guild → sesión: crea sesiones al conectar,
/// las destruye al salir del canal y vigila la inactividad para
/// auto-desconectar.
pub struct SessionRegistry {
    sessions: Arc<DashMap<GuildId, Arc<PlaybackSession>>>,
    manager: Arc<Songbird>,
    backends: Arc<BackendSet>,
    cache: Arc<CacheStore>,
    http: reqwest::Client,
    sink: Arc<dyn RenderSink>,
    session_cfg: SessionConfig,
    auto_leave_poll: Duration,
}

impl SessionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<Songbird>,
        backends: Arc<BackendSet>,
        cache: Arc<CacheStore>,
        http: reqwest::Client,
        sink: Arc<dyn RenderSink>,
        session_cfg: SessionConfig,
        auto_leave_poll: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            manager,
            backends,
            cache,
            http,
            sink,
            session_cfg,
            auto_leave_poll,
        })
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<PlaybackSession>> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    /// Sesión de la guild, conectando al canal de voz del usuario si hace
    /// falta. `Ok(None)` significa que el usuario no está en ningún canal.
    pub async fn connect(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        user_id: UserId,
        text_channel: ChannelId,
    ) -> Result<Option<Arc<PlaybackSession>>> {
        let Some(voice_channel) = user_voice_channel(ctx, guild_id, user_id) else {
            return Ok(None);
        };

        if self.manager.get(guild_id).is_none() {
            // Una sesión sin llamada viva es un resto de una conexión
            // anterior (expulsión, reinicio del gateway).
            if let Some((_, stale)) = self.sessions.remove(&guild_id) {
                warn!("🧹 Sesión huérfana en guild {guild_id}, destruyendo");
                stale.teardown().await;
            }
            self.manager
                .join(guild_id, voice_channel)
                .await
                .context("no se pudo entrar al canal de voz")?;
            info!("🔊 Conectado al canal {voice_channel} en guild {guild_id}");
        }

        if let Some(existing) = self.get(guild_id) {
            return Ok(Some(existing));
        }

        let announcer = Arc::new(ChannelAnnouncer::new(ctx.http.clone(), text_channel));
        let session = PlaybackSession::new(
            guild_id,
            self.backends.clone(),
            self.cache.clone(),
            self.http.clone(),
            self.sink.clone(),
            announcer,
            self.session_cfg.clone(),
        );
        self.spawn_auto_leave(session.clone());
        self.sessions.insert(guild_id, session.clone());
        Ok(Some(session))
    }

    /// Destruye la sesión y abandona el canal de voz. Devuelve si había
    /// algo que soltar.
    pub async fn disconnect(&self, guild_id: GuildId) -> bool {
        let had_session = match self.sessions.remove(&guild_id) {
            Some((_, session)) => {
                session.teardown().await;
                true
            }
            None => false,
        };

        let had_call = self.manager.get(guild_id).is_some();
        if had_call {
            if let Err(e) = self.manager.remove(guild_id).await {
                warn!("⚠️ No se pudo salir del canal en guild {guild_id}: {e}");
            }
        }
        had_session || had_call
    }

    /// Apagado ordenado del proceso: destruye todas las sesiones vivas y
    /// abandona sus canales de voz antes de soltar el gateway.
    pub async fn shutdown_all(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|e| *e.key()).collect();
        for guild_id in guilds {
            self.disconnect(guild_id).await;
        }
        info!("🛑 Todas las sesiones destruidas");
    }

    /// Vigía de inactividad de una sesión: cuando lleva demasiado sin
    /// sonar, la destruye y abandona el canal. El token de la sesión
    /// corta el bucle si alguien la destruyó antes.
    fn spawn_auto_leave(&self, session: Arc<PlaybackSession>) {
        let sessions = self.sessions.clone();
        let manager = self.manager.clone();
        let guild_id = session.guild_id();
        let threshold = self.session_cfg.auto_leave;
        let poll = self.auto_leave_poll;
        let cancel = session.cancel_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let idle = session.idle_for().await;
                if idle.is_some_and(|d| d >= threshold) {
                    info!("🚪 Auto-desconexión por inactividad en guild {guild_id}");
                    sessions.remove(&guild_id);
                    session.teardown().await;
                    if let Err(e) = manager.remove(guild_id).await {
                        debug!("Salida de voz tras inactividad: {e}");
                    }
                    return;
                }
            }
        });
    }
}

/// Canal de voz en el que está el usuario, si está en alguno.
fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = ctx.cache.guild(guild_id)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|vs| vs.channel_id)
}
