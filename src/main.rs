use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod backends;
mod bot;
mod cache;
mod config;
mod player;
mod track;
mod ui;

use crate::backends::{BackendSet, ExtractorBackend, HiFiBackend, PremiumBackend, StreamBackend};
use crate::bot::TonearmBot;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::player::render::SongbirdSink;
use crate::player::queue::QueueCaps;
use crate::player::{SessionConfig, SessionRegistry};

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tonearm=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Tonearm v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    // El tamaño del runtime sale de la configuración, así que se
    // construye a mano en vez de usar #[tokio::main].
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    // Health check para contenedores: solo comprueba el extractor
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    info!("{}", config.summary());

    let http = reqwest::Client::new();
    let cache = Arc::new(CacheStore::new(&config.cache_dir)?);
    let backends = Arc::new(build_backends(&config, &http, &cache));

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let manager = Songbird::serenity();
    let sink = Arc::new(SongbirdSink::new(
        manager.clone(),
        http.clone(),
        tokio::runtime::Handle::current(),
    ));

    let session_cfg = SessionConfig {
        caps: QueueCaps {
            max_size: config.max_queue_size,
            history: config.history_cap,
            previous: config.previous_cap,
        },
        default_volume: config.default_volume,
        auto_leave: Duration::from_secs(config.auto_leave_secs),
        ..SessionConfig::default()
    };
    let registry = SessionRegistry::new(
        manager.clone(),
        backends,
        cache.clone(),
        http,
        sink,
        session_cfg,
        Duration::from_secs(config.auto_leave_poll_secs),
    );

    let config = Arc::new(config);
    let handler = TonearmBot::new(config.clone(), registry.clone(), cache);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(manager)
        .await?;

    // Shutdown ordenado: primero las sesiones (salen de sus canales de
    // voz y sueltan streams), después los shards; start() retorna solo.
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        registry.shutdown_all().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Construye la cadena de backends en el orden de prioridad configurado.
/// Los que no tienen credenciales simplemente no entran en la cadena.
fn build_backends(config: &Config, http: &reqwest::Client, cache: &Arc<CacheStore>) -> BackendSet {
    let mut available: Vec<Arc<dyn StreamBackend>> = Vec::new();

    if let (Some(base), Some(token)) = (&config.hifi_api_base, &config.hifi_token) {
        available.push(Arc::new(HiFiBackend::new(
            http.clone(),
            base,
            token,
            cache.clone(),
        )));
    }
    if let (Some(base), Some(token)) = (&config.premium_api_base, &config.premium_token) {
        available.push(Arc::new(PremiumBackend::new(
            http.clone(),
            base,
            token,
            &config.premium_quality,
            cache.clone(),
            config.aggressive_cache,
        )));
    }
    available.push(Arc::new(ExtractorBackend::new()));

    for backend in &available {
        info!("🎛️ Backend disponible: {}", backend.kind());
    }
    BackendSet::ordered(&config.backend_order, available)
}

async fn health_check() -> Result<()> {
    match ExtractorBackend::verify_binary().await {
        Ok(version) => {
            println!("OK yt-dlp {}", version.trim());
            Ok(())
        }
        Err(e) => anyhow::bail!("Dependencias faltantes: {}", e),
    }
}
