//! Capa Discord del bot: registro de comandos, despacho de interacciones
//! y limpieza cuando el gateway nos desconecta de un canal.
//!
//! Toda la lógica de reproducción vive en [`crate::player`]; aquí solo se
//! traducen interacciones a llamadas sobre el registro de sesiones.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use tracing::{error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    backends::ExtractorBackend, cache::CacheStore, config::Config, player::SessionRegistry,
};

/// Manejador de eventos principal del bot.
pub struct TonearmBot {
    config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    cache: Arc<CacheStore>,
}

impl TonearmBot {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>, cache: Arc<CacheStore>) -> Self {
        Self {
            config,
            registry,
            cache,
        }
    }

    /// Registra los comandos slash: por guild si hay una configurada
    /// (propagación inmediata, para desarrollo), globales si no.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::from(guild_id);
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild configurada: {}", guild_id);
                    return Ok(());
                }
                commands::register_guild_commands(ctx, guild_id).await?;
                info!("✅ Comandos registrados para guild {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for TonearmBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        let config = self.config.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            maintenance_tasks(config, cache).await;
        });
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Si alguien echa al bot del canal (o el gateway lo desconecta), la
    /// sesión de esa guild se destruye igual que con `/leave`.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        if old.is_some() && new.channel_id.is_none() {
            if let Some(guild_id) = new.guild_id {
                info!("🔌 Bot desconectado en guild {}", guild_id);
                self.registry.disconnect(guild_id).await;
            }
        }
    }
}

/// Tareas de mantenimiento de fondo, una pasada por hora: barrido de
/// entradas viejas del caché y comprobación del binario extractor.
async fn maintenance_tasks(config: Arc<Config>, cache: Arc<CacheStore>) {
    let max_age = Duration::from_secs(config.cache_max_age_hours * 3600);
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    interval.tick().await;

    loop {
        interval.tick().await;

        match cache.sweep_older_than(max_age).await {
            Ok(0) => {}
            Ok(n) => info!("🧹 Barrido de caché: {} entradas desalojadas", n),
            Err(e) => warn!("⚠️ Barrido de caché falló: {}", e),
        }

        if let Err(e) = ExtractorBackend::verify_binary().await {
            warn!("⚠️ yt-dlp no disponible: {}", e);
        }

        info!("🧹 Tareas de mantenimiento completadas");
    }
}
