use serenity::all::Timestamp;
use serenity::builder::{CreateEmbed, CreateEmbedFooter};
use std::time::Duration;

use crate::player::queue::{AddSummary, HistoryEntry, LoopMode, QueueSnapshot};
use crate::player::session::NowPlayingStatus;
use crate::track::NowPlayingCard;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Tonearm";

const ITEMS_PER_PAGE: usize = 10;

/// Embed de "reproduciendo ahora". Con `status` añade la barra de
/// progreso; sin él es el anuncio automático al cambiar de pista.
pub fn now_playing_embed(card: &NowPlayingCard, status: Option<&NowPlayingStatus>) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**{}**", card.title))
        .color(colors::SUCCESS_GREEN)
        .field(
            "🎤 Artista",
            card.artist.as_deref().unwrap_or("Desconocido"),
            true,
        );

    if let Some(album) = &card.album {
        embed = embed.field("💿 Álbum", album, true);
    }

    match card.duration {
        Some(duration) => embed = embed.field("⏱️ Duración", format_duration(duration), true),
        None => embed = embed.field("⏱️ Duración", "🔴 En vivo", true),
    }

    if let Some(status) = status {
        let state = if status.paused { "⏸️" } else { "▶️" };
        let loop_mark = match status.loop_mode {
            LoopMode::Track => " 🔂",
            LoopMode::Queue => " 🔁",
            LoopMode::Off => "",
        };
        let progress = match card.duration {
            Some(total) => format!(
                "{} `{} / {}`{}\n{}",
                state,
                format_duration(status.elapsed),
                format_duration(total),
                loop_mark,
                progress_bar(status.elapsed, total)
            ),
            None => format!(
                "{} `{}`{}",
                state,
                format_duration(status.elapsed),
                loop_mark
            ),
        };
        embed = embed.field("📊 Progreso", progress, false);
    }

    if let Some(cover) = &card.cover_url {
        embed = embed.thumbnail(cover);
    }
    if let Some(url) = &card.source_url {
        embed = embed.url(url);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed según el escalón del resumen: una pista con detalle, dos o tres
/// listadas, y a partir de ahí las tres primeras más "y N más".
pub fn track_added_embed(summary: &AddSummary) -> CreateEmbed {
    let (title, description) = match summary {
        AddSummary::Single { title } => (
            "✅ Canción Agregada".to_string(),
            format!("**{title}** se agregó a la cola"),
        ),
        AddSummary::Few { titles } => (
            format!("✅ {} Canciones Agregadas", titles.len()),
            titles
                .iter()
                .map(|t| format!("• **{t}**"))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        AddSummary::Many { first, rest } => (
            format!("📋 {} Canciones Agregadas", first.len() + rest),
            format!(
                "{}\n… y **{} más**",
                first
                    .iter()
                    .map(|t| format!("• **{t}**"))
                    .collect::<Vec<_>>()
                    .join("\n"),
                rest
            ),
        ),
    };

    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(
            "🎵 Se reproducirá automáticamente si no hay música sonando",
        ))
}

/// Aviso de pista que ningún backend pudo servir (se salta sola).
pub fn track_unavailable_embed(card: &NowPlayingCard) -> CreateEmbed {
    CreateEmbed::default()
        .title("⚠️ Pista No Disponible")
        .description(format!(
            "**{}** no se pudo reproducir en ningún servicio; se salta",
            card.title
        ))
        .color(colors::WARNING_ORANGE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn queue_finished_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("🏁 Cola Terminada")
        .description("No quedan canciones.\n\n💡 Usa `/play <canción>` para seguir")
        .color(colors::NEUTRAL_GRAY)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed paginado de la cola de reproducción.
pub fn queue_embed(snapshot: &QueueSnapshot, page: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    let Some(current) = &snapshot.current else {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    };

    let status = match snapshot.loop_mode {
        LoopMode::Track => "🔂",
        LoopMode::Queue => "🔁",
        LoopMode::Off => "▶️",
    };
    embed = embed.field(
        format!("{status} Reproduciendo"),
        match current.artist() {
            Some(artist) => format!("**{}** - {}", current.title(), artist),
            None => format!("**{}**", current.title()),
        },
        false,
    );

    let queue_page = snapshot.page(page, ITEMS_PER_PAGE);
    if !queue_page.items.is_empty() {
        let mut description = String::new();
        for (i, item) in queue_page.items.iter().enumerate() {
            let position = (queue_page.current_page - 1) * ITEMS_PER_PAGE + i + 1;
            description.push_str(&format!("**{position}**. {}", item.title()));
            if let Some(artist) = item.artist() {
                description.push_str(&format!(" - {artist}"));
            }
            if let Some(duration) = item.duration() {
                description.push_str(&format!(" `[{}]`", format_duration(duration)));
            }
            description.push('\n');
        }
        embed = embed.field("Próximas canciones", description, false);
    }

    let mut info = format!("**Total:** {} canciones", queue_page.total_items + 1);
    if snapshot.total_duration > Duration::ZERO {
        info.push_str(&format!(
            " • **Duración:** {}",
            humantime::format_duration(Duration::from_secs(snapshot.total_duration.as_secs()))
        ));
    }
    if snapshot.shuffled {
        info.push_str(" • 🔀 **Aleatorio**");
    }
    embed = embed.field("Información", info, false);

    if queue_page.total_pages > 1 {
        embed = embed.footer(CreateEmbedFooter::new(format!(
            "Página {} de {} • Tonearm",
            queue_page.current_page, queue_page.total_pages
        )));
    } else {
        embed = embed.footer(CreateEmbedFooter::new(STANDARD_FOOTER));
    }

    embed.timestamp(Timestamp::now())
}

/// Historial de reproducción, la más reciente primero.
pub fn history_embed(entries: &[HistoryEntry]) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📜 Historial")
        .color(colors::MUSIC_PURPLE);

    if entries.is_empty() {
        return embed
            .description("😴 Todavía no ha sonado nada")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    let mut description = String::new();
    for (i, entry) in entries.iter().take(ITEMS_PER_PAGE).enumerate() {
        description.push_str(&format!("**{}**. {}", i + 1, entry.title));
        if let Some(artist) = &entry.artist {
            description.push_str(&format!(" - {artist}"));
        }
        // Marca de tiempo relativa de Discord ("hace 5 minutos").
        description.push_str(&format!(" <t:{}:R>\n", entry.played_at.timestamp()));
    }

    embed
        .description(description)
        .footer(CreateEmbedFooter::new(format!(
            "{} pistas en el historial • Tonearm",
            entries.len()
        )))
        .timestamp(Timestamp::now())
}

/// Embed de ayuda general
pub fn help_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Tonearm - Guía")
        .color(colors::INFO_BLUE)
        .description("Bot de música con varios servicios y caché local")
        .field(
            "🎵 Reproducción",
            "• `/play <canción>` - Reproduce o encola\n\
            • `/pause` / `/resume` - Pausa y reanuda\n\
            • `/skip` - Salta la canción actual\n\
            • `/previous` - Vuelve a la anterior\n\
            • `/seek <posición>` - Salta a un punto (`1:23` o segundos)",
            false,
        )
        .field(
            "📜 Cola",
            "• `/queue [página]` - Muestra la cola\n\
            • `/shuffle` - Activa/desactiva aleatorio\n\
            • `/loop <modo>` - Repetición: off, canción o cola\n\
            • `/remove <posición>` - Quita una canción\n\
            • `/clear` - Vacía la cola\n\
            • `/history` - Últimas canciones sonadas",
            false,
        )
        .field(
            "🔊 Conexión",
            "• `/join` / `/leave` - Entra y sale del canal\n\
            • `/volume <nivel>` - Volumen 0-200\n\
            • `/nowplaying` - Qué está sonando",
            false,
        )
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {title}"))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de éxito
pub fn success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {title}"))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de información
pub fn info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("ℹ️ {title}"))
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Barra visual de progreso de reproducción
fn progress_bar(elapsed: Duration, total: Duration) -> String {
    let segments = 20usize;
    let ratio = if total.is_zero() {
        0.0
    } else {
        (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    };
    let filled = (ratio * segments as f64).round() as usize;
    let bar = "█".repeat(filled) + &"▒".repeat(segments - filled);
    format!("`[{bar}]`")
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(75)), "1:15");
        assert_eq!(format_duration(Duration::from_secs(3671)), "1:01:11");
        assert_eq!(format_duration(Duration::ZERO), "0:00");
    }

    #[test]
    fn test_barra_de_progreso() {
        let bar = progress_bar(Duration::from_secs(30), Duration::from_secs(60));
        assert_eq!(bar.matches('█').count(), 10);
        assert_eq!(bar.matches('▒').count(), 10);

        // Duración desconocida o cero no divide entre cero.
        let bar = progress_bar(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(bar.matches('█').count(), 0);
    }
}
