use std::sync::Arc;

use async_trait::async_trait;
use serenity::builder::CreateMessage;
use serenity::http::Http;
use serenity::model::id::ChannelId;
use tracing::warn;

use crate::track::NowPlayingCard;
use crate::ui::embeds;

/// Avisos que la sesión emite por su cuenta (sin comando de por medio):
/// cambio de pista, pista imposible de servir y cola agotada.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn now_playing(&self, card: &NowPlayingCard);
    async fn track_unavailable(&self, card: &NowPlayingCard);
    async fn queue_finished(&self);
}

/// Implementación real: publica embeds en el canal de texto desde el que
/// se invocó la sesión.
pub struct ChannelAnnouncer {
    http: Arc<Http>,
    channel: ChannelId,
}

impl ChannelAnnouncer {
    pub fn new(http: Arc<Http>, channel: ChannelId) -> Self {
        Self { http, channel }
    }

    async fn send(&self, message: CreateMessage) {
        if let Err(e) = self.channel.send_message(self.http.as_ref(), message).await {
            warn!("⚠️ No se pudo publicar el aviso en {}: {}", self.channel, e);
        }
    }
}

#[async_trait]
impl Announcer for ChannelAnnouncer {
    async fn now_playing(&self, card: &NowPlayingCard) {
        self.send(CreateMessage::new().embed(embeds::now_playing_embed(card, None)))
            .await;
    }

    async fn track_unavailable(&self, card: &NowPlayingCard) {
        self.send(CreateMessage::new().embed(embeds::track_unavailable_embed(card)))
            .await;
    }

    async fn queue_finished(&self) {
        self.send(CreateMessage::new().embed(embeds::queue_finished_embed()))
            .await;
    }
}
