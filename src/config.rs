use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backends::BackendKind;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Reproducción
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub history_cap: usize,
    pub previous_cap: usize,

    // Backends, en orden de prioridad
    pub backend_order: Vec<BackendKind>,
    pub hifi_api_base: Option<String>,
    pub hifi_token: Option<String>,
    pub premium_api_base: Option<String>,
    pub premium_token: Option<String>,
    pub premium_quality: String,

    // Caché
    pub cache_dir: PathBuf,
    pub cache_max_age_hours: u64,
    pub aggressive_cache: bool,

    // Sesión
    pub auto_leave_secs: u64,
    pub auto_leave_poll_secs: u64,

    // Rendimiento
    pub worker_threads: usize,
}

// serde solo serializa BackendKind dentro de Config; el resto del
// programa lo pasa como enum.
impl Serialize for BackendKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BackendKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Self::parse_name(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("backend desconocido: {raw}")))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Reproducción
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            history_cap: std::env::var("HISTORY_CAP")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            previous_cap: std::env::var("PREVIOUS_CAP")
                .unwrap_or_else(|_| "25".to_string())
                .parse()?,

            // Backends
            backend_order: parse_backend_order(
                &std::env::var("BACKEND_ORDER")
                    .unwrap_or_else(|_| "hifi,premium,extractor".to_string()),
            )?,
            hifi_api_base: std::env::var("HIFI_API_BASE").ok().filter(|s| !s.is_empty()),
            hifi_token: std::env::var("HIFI_TOKEN").ok().filter(|s| !s.is_empty()),
            premium_api_base: std::env::var("PREMIUM_API_BASE")
                .ok()
                .filter(|s| !s.is_empty()),
            premium_token: std::env::var("PREMIUM_TOKEN").ok().filter(|s| !s.is_empty()),
            premium_quality: std::env::var("PREMIUM_QUALITY")
                .unwrap_or_else(|_| "high".to_string()),

            // Caché
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "./cache".to_string())
                .into(),
            cache_max_age_hours: std::env::var("CACHE_MAX_AGE_HOURS")
                .unwrap_or_else(|_| "72".to_string())
                .parse()?,
            aggressive_cache: std::env::var("AGGRESSIVE_CACHE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            // Sesión
            auto_leave_secs: std::env::var("AUTO_LEAVE_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
            auto_leave_poll_secs: std::env::var("AUTO_LEAVE_POLL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,

            // Rendimiento
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Comprobaciones de cordura antes de arrancar el bot.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume < 0.0 || self.default_volume > 2.0 {
            anyhow::bail!(
                "El volumen por defecto debe estar entre 0.0 y 2.0, no {}",
                self.default_volume
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("El tamaño máximo de cola debe ser mayor que 0");
        }

        if self.backend_order.is_empty() {
            anyhow::bail!("BACKEND_ORDER no puede estar vacío");
        }

        if self.backend_order.contains(&BackendKind::HiFi)
            && self.hifi_api_base.is_some() != self.hifi_token.is_some()
        {
            anyhow::bail!("HIFI_API_BASE y HIFI_TOKEN van juntos: falta uno de los dos");
        }

        if self.backend_order.contains(&BackendKind::Premium)
            && self.premium_api_base.is_some() != self.premium_token.is_some()
        {
            anyhow::bail!("PREMIUM_API_BASE y PREMIUM_TOKEN van juntos: falta uno de los dos");
        }

        if self.auto_leave_secs == 0 || self.auto_leave_poll_secs == 0 {
            anyhow::bail!("Los tiempos de auto-desconexión deben ser mayores que 0");
        }

        Ok(())
    }

    /// Resumen sin secretos para el log de arranque.
    pub fn summary(&self) -> String {
        let order: Vec<&str> = self.backend_order.iter().map(|b| b.as_str()).collect();
        format!(
            "Config:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Reproducción: {}% vol, cola de {}, historial {}\n  \
            Backends: {} (hifi: {}, premium: {} [{}])\n  \
            Caché: {} (max {}h, agresiva={})\n  \
            Auto-desconexión: {}s (sondeo cada {}s)",
            self.application_id,
            self.guild_id
                .map_or("global".to_string(), |id| id.to_string()),
            (self.default_volume * 100.0) as u32,
            self.max_queue_size,
            self.history_cap,
            order.join(" → "),
            if self.hifi_token.is_some() { "sí" } else { "no" },
            if self.premium_token.is_some() { "sí" } else { "no" },
            self.premium_quality,
            self.cache_dir.display(),
            self.cache_max_age_hours,
            self.aggressive_cache,
            self.auto_leave_secs,
            self.auto_leave_poll_secs,
        )
    }
}

/// Interpreta la lista de prioridad de backends ("hifi,premium,extractor").
/// Nombres desconocidos son error; los repetidos cuentan una sola vez.
fn parse_backend_order(raw: &str) -> Result<Vec<BackendKind>> {
    let mut order = Vec::new();
    for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let kind = BackendKind::parse_name(name)
            .ok_or_else(|| anyhow::anyhow!("backend desconocido en BACKEND_ORDER: {name}"))?;
        if !order.contains(&kind) {
            order.push(kind);
        }
    }
    Ok(order)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin defaults: son obligatorios)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            default_volume: 0.5,
            max_queue_size: 100,
            history_cap: 50,
            previous_cap: 25,

            backend_order: vec![
                BackendKind::HiFi,
                BackendKind::Premium,
                BackendKind::Extractor,
            ],
            hifi_api_base: None,
            hifi_token: None,
            premium_api_base: None,
            premium_token: None,
            premium_quality: "high".into(),

            cache_dir: "./cache".into(),
            cache_max_age_hours: 72,
            aggressive_cache: true,

            auto_leave_secs: 300,
            auto_leave_poll_secs: 30,

            worker_threads: num_cpus::get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orden_de_backends() {
        assert_eq!(
            parse_backend_order("hifi, premium ,extractor").unwrap(),
            vec![
                BackendKind::HiFi,
                BackendKind::Premium,
                BackendKind::Extractor
            ]
        );
        // Repetidos cuentan una vez; desconocidos son error.
        assert_eq!(
            parse_backend_order("premium,premium").unwrap(),
            vec![BackendKind::Premium]
        );
        assert!(parse_backend_order("spotify").is_err());
    }

    #[test]
    fn test_validacion() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.default_volume = 3.0;
        assert!(config.validate().is_err());
        config.default_volume = 0.5;

        config.backend_order.clear();
        assert!(config.validate().is_err());
        config.backend_order = vec![BackendKind::HiFi];

        // Token sin base (o al revés) es un error de configuración.
        config.hifi_token = Some("t".into());
        assert!(config.validate().is_err());
        config.hifi_api_base = Some("https://api".into());
        assert!(config.validate().is_ok());
    }
}
