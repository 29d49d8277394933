use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serenity::{
    builder::{
        CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::application::CommandInteraction,
    prelude::Context,
};
use tracing::info;

use crate::{
    backends::BackendKind,
    bot::TonearmBot,
    player::{LoopMode, PlaybackSession},
    track::Track,
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &TonearmBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, command, bot).await?,
        "pause" => handle_pause(ctx, command, bot).await?,
        "resume" => handle_resume(ctx, command, bot).await?,
        "skip" => handle_skip(ctx, command, bot).await?,
        "previous" => handle_previous(ctx, command, bot).await?,
        "seek" => handle_seek(ctx, command, bot).await?,
        "queue" => handle_queue(ctx, command, bot).await?,
        "nowplaying" => handle_nowplaying(ctx, command, bot).await?,
        "history" => handle_history(ctx, command, bot).await?,
        "shuffle" => handle_shuffle(ctx, command, bot).await?,
        "loop" => handle_loop(ctx, command, bot).await?,
        "volume" => handle_volume(ctx, command, bot).await?,
        "clear" => handle_clear(ctx, command, bot).await?,
        "remove" => handle_remove(ctx, command, bot).await?,
        "join" => handle_join(ctx, command, bot).await?,
        "leave" => handle_leave(ctx, command, bot).await?,
        "help" => handle_help(ctx, command, bot).await?,
        _ => {
            respond_ephemeral(ctx, &command, "❌ Comando no reconocido").await?;
        }
    }

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let guild_id = command.guild_id.unwrap();
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .to_string();
    let play_next = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "next")
        .and_then(|opt| opt.value.as_bool())
        .unwrap_or(false);

    // Defer la respuesta: conectar y resolver puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let Some(session) = bot
        .registry
        .connect(ctx, guild_id, command.user.id, command.channel_id)
        .await?
    else {
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new()
                    .embed(embeds::error_embed("Sin canal", "Debes estar en un canal de voz")),
            )
            .await?;
        return Ok(());
    };

    let track = build_track(&query, &command);
    match session.add_to_queue(vec![track], play_next).await {
        Ok(summary) => {
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().embed(embeds::track_added_embed(&summary)),
                )
                .await?;
        }
        Err(full) => {
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new()
                        .embed(embeds::error_embed("Cola llena", &full.to_string())),
                )
                .await?;
        }
    }

    Ok(())
}

async fn handle_pause(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    if session.pause().await {
        respond(ctx, &command, "⏸️ Reproducción pausada").await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ No hay nada que pausar").await?;
    }
    Ok(())
}

async fn handle_resume(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    if session.resume().await {
        respond(ctx, &command, "▶️ Reproducción reanudada").await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ No hay nada pausado").await?;
    }
    Ok(())
}

async fn handle_skip(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    if session.skip_track().await {
        respond(ctx, &command, "⏭️ Canción saltada").await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ No hay nada reproduciéndose").await?;
    }
    Ok(())
}

async fn handle_previous(
    ctx: &Context,
    command: CommandInteraction,
    bot: &TonearmBot,
) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    if session.play_previous().await {
        respond(ctx, &command, "⏮️ Volviendo a la canción anterior").await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ No hay canción anterior").await?;
    }
    Ok(())
}

async fn handle_seek(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let raw = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "position")
        .and_then(|opt| opt.value.as_str())
        .unwrap_or_default();

    let Some(position) = parse_position(raw) else {
        respond_ephemeral(ctx, &command, "❌ Posición inválida (usa segundos o m:ss)").await?;
        return Ok(());
    };

    if session.seek(position).await {
        respond(
            ctx,
            &command,
            format!("⏩ Saltando a {}", embeds::format_duration(position)),
        )
        .await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ No hay nada reproduciéndose").await?;
    }
    Ok(())
}

async fn handle_queue(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let page = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "page")
        .and_then(|opt| opt.value.as_i64())
        .unwrap_or(1)
        .max(1) as usize;

    let snapshot = session.queue_snapshot().await;
    let embed = embeds::queue_embed(&snapshot, page);
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

async fn handle_nowplaying(
    ctx: &Context,
    command: CommandInteraction,
    bot: &TonearmBot,
) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    match session.now_playing().await {
        Some(status) => {
            let embed = embeds::now_playing_embed(&status.card, Some(&status));
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new().embed(embed),
                    ),
                )
                .await?;
        }
        None => {
            respond_ephemeral(ctx, &command, "❌ No hay nada reproduciéndose actualmente").await?;
        }
    }
    Ok(())
}

async fn handle_history(
    ctx: &Context,
    command: CommandInteraction,
    bot: &TonearmBot,
) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let entries = session.history_snapshot().await;
    let embed = embeds::history_embed(&entries);
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

async fn handle_shuffle(
    ctx: &Context,
    command: CommandInteraction,
    bot: &TonearmBot,
) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let shuffled = session.toggle_shuffle().await;
    respond(
        ctx,
        &command,
        if shuffled {
            "🔀 Modo aleatorio activado"
        } else {
            "➡️ Modo aleatorio desactivado"
        },
    )
    .await?;
    Ok(())
}

async fn handle_loop(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let mode = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "mode")
        .and_then(|opt| opt.value.as_str())
        .unwrap_or("off");

    let (mode, message) = match mode {
        "track" => (LoopMode::Track, "🔂 Repetir canción activado"),
        "queue" => (LoopMode::Queue, "🔁 Repetir cola activado"),
        _ => (LoopMode::Off, "➡️ Repetición desactivada"),
    };
    session.set_loop(mode).await;

    respond(ctx, &command, message).await?;
    Ok(())
}

async fn handle_volume(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let level = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "level")
        .and_then(|opt| opt.value.as_i64());

    match level {
        Some(level) => {
            let applied = session.set_volume(level as f32 / 100.0).await;
            respond(
                ctx,
                &command,
                format!("🔊 Volumen ajustado a {}%", (applied * 100.0).round() as i64),
            )
            .await?;
        }
        None => {
            let current = session.volume().await;
            respond(
                ctx,
                &command,
                format!("🔊 Volumen actual: {}%", (current * 100.0).round() as i64),
            )
            .await?;
        }
    }
    Ok(())
}

async fn handle_clear(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let removed = session.clear_queue().await;
    respond(ctx, &command, format!("🗑️ {} canciones quitadas de la cola", removed)).await?;
    Ok(())
}

async fn handle_remove(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let Some(session) = session_or_notice(ctx, &command, bot).await? else {
        return Ok(());
    };

    let position = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "position")
        .and_then(|opt| opt.value.as_i64())
        .unwrap_or(0)
        .max(0) as usize;

    match session.remove_track(position).await {
        Some(title) => {
            respond(ctx, &command, format!("🗑️ **{}** quitada de la cola", title)).await?;
        }
        None => {
            respond_ephemeral(ctx, &command, "❌ No hay ninguna canción en esa posición").await?;
        }
    }
    Ok(())
}

async fn handle_join(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let guild_id = command.guild_id.unwrap();

    let session = bot
        .registry
        .connect(ctx, guild_id, command.user.id, command.channel_id)
        .await?;

    if session.is_some() {
        respond(ctx, &command, "🔊 Conectado al canal de voz").await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ Debes estar en un canal de voz").await?;
    }
    Ok(())
}

async fn handle_leave(ctx: &Context, command: CommandInteraction, bot: &TonearmBot) -> Result<()> {
    let guild_id = command.guild_id.unwrap();

    if bot.registry.disconnect(guild_id).await {
        respond(ctx, &command, "👋 Desconectado del canal de voz").await?;
    } else {
        respond_ephemeral(ctx, &command, "❌ No estoy en ningún canal de voz").await?;
    }
    Ok(())
}

async fn handle_help(ctx: &Context, command: CommandInteraction, _bot: &TonearmBot) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embeds::help_embed())
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

// Funciones auxiliares

/// Sesión de la guild, o un aviso efímero si no hay ninguna (el bot no
/// está en un canal de voz).
async fn session_or_notice(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &TonearmBot,
) -> Result<Option<Arc<PlaybackSession>>> {
    let guild_id = command.guild_id.unwrap();
    match bot.registry.get(guild_id) {
        Some(session) => Ok(Some(session)),
        None => {
            respond_ephemeral(ctx, command, "❌ No hay una sesión activa (usa /play o /join)")
                .await?;
            Ok(None)
        }
    }
}

/// Construye la pista que pide `/play`: una URL directa va al extractor
/// tal cual; cualquier otra cosa es un término de búsqueda.
fn build_track(query: &str, command: &CommandInteraction) -> Track {
    let track = match url::Url::parse(query) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
            Track::new(BackendKind::Extractor, query, query).with_source_url(query)
        }
        _ => Track::new(BackendKind::Extractor, query, query),
    };
    track.with_requested_by(command.user.id)
}

/// Interpreta la posición de `/seek`: segundos a secas, `m:ss` o `h:mm:ss`.
fn parse_position(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let clock = regex::Regex::new(r"^(?:(\d+):)?(\d{1,2}):(\d{2})$").ok()?;
    let caps = clock.captures(raw)?;
    let hours: u64 = caps.get(1).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
    let minutes: u64 = caps[2].parse().ok()?;
    let seconds: u64 = caps[3].parse().ok()?;
    if seconds >= 60 || (caps.get(1).is_some() && minutes >= 60) {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_ephemeral(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_position("1:30"), Some(Duration::from_secs(90)));
        assert_eq!(parse_position(" 0:05 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_position("1:02:03"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_position("1:75"), None);
        assert_eq!(parse_position("atrás"), None);
        assert_eq!(parse_position(""), None);
    }
}
