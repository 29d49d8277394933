//! # Cache Module
//!
//! Content-addressed audio cache for Tonearm.
//!
//! Finished streams are persisted as plain files named by the SHA-256 of
//! `backend:track_id` plus the container extension. The cache is the only
//! durable state the bot keeps: queues and sessions live in memory, the
//! cache survives restarts and turns replays, seeks and loops into local
//! file playback.
//!
//! ## Write protocol
//!
//! - Writers stream into an anonymous temp file inside the cache directory
//!   and atomically rename it into place on completion. Readers therefore
//!   never observe a partially written entry under its final name.
//! - While a download is in flight the entry is registered as *pending*;
//!   lookups skip pending entries and tail readers can follow the growing
//!   temp file, blocking at the written boundary until more bytes land.
//! - A writer dropped without `finish()` marks the download failed and the
//!   temp file is removed with it.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_DIR=./cache           # Directory for cached audio files
//! CACHE_MAX_AGE_HOURS=72      # Age-based eviction threshold
//! AGGRESSIVE_CACHE=true       # Redirect premium streams through the cache
//! ```

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::track::stream::MediaStream;

/// Bloque máximo que entrega un lector de cola por llamada.
const TAIL_READ_MAX: usize = 64 * 1024;

const PENDING_ACTIVE: u8 = 0;
const PENDING_DONE: u8 = 1;
const PENDING_FAILED: u8 = 2;

/// Descarga en curso observable por lectores de cola.
pub struct PendingEntry {
    temp_path: PathBuf,
    written: AtomicU64,
    expected: Option<u64>,
    state: AtomicU8,
    notify: Notify,
}

impl PendingEntry {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING_DONE
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING_FAILED
    }

    /// Espera hasta que haya bytes más allá de `offset` o la descarga llegue
    /// a un estado terminal. Devuelve el total escrito hasta el momento.
    pub async fn wait_past(&self, offset: u64) -> u64 {
        loop {
            let written = self.written.load(Ordering::Acquire);
            if written > offset || self.state.load(Ordering::Acquire) != PENDING_ACTIVE {
                return written;
            }

            // Registrarse antes de recomprobar para no perder la señal.
            let notified = self.notify.notified();
            let written = self.written.load(Ordering::Acquire);
            if written > offset || self.state.load(Ordering::Acquire) != PENDING_ACTIVE {
                return written;
            }
            notified.await;
        }
    }
}

/// Caché de audio direccionada por contenido.
pub struct CacheStore {
    dir: PathBuf,
    pending: Arc<DashMap<String, Arc<PendingEntry>>>,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            pending: Arc::new(DashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clave de contenido: SHA-256 de `backend:id`.
    pub fn key(backend: &str, id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(backend.as_bytes());
        hasher.update(b":");
        hasher.update(id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ext}"))
    }

    /// Busca una entrada completa en disco. Las descargas en curso no
    /// cuentan: su nombre final todavía no existe.
    pub fn lookup(&self, backend: &str, id: &str, ext: &str) -> Option<PathBuf> {
        let key = Self::key(backend, id);
        if self.pending.contains_key(&key) {
            return None;
        }
        let path = self.entry_path(&key, ext);
        path.exists().then_some(path)
    }

    /// Como `lookup`, pero sin fijar el contenedor: encuentra la entrada
    /// sellada de la clave con la extensión que tenga y la devuelve junto
    /// al contenedor. Para backends cuyo contenedor decide el servidor
    /// ticket a ticket.
    pub fn lookup_any(&self, backend: &str, id: &str) -> Option<(PathBuf, String)> {
        let key = Self::key(backend, id);
        if self.pending.contains_key(&key) {
            return None;
        }
        for entry in std::fs::read_dir(&self.dir).ok()?.flatten() {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) != Some(key.as_str()) {
                continue;
            }
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                return Some((path.clone(), ext.to_string()));
            }
        }
        None
    }

    pub fn is_pending(&self, backend: &str, id: &str) -> bool {
        self.pending.contains_key(&Self::key(backend, id))
    }

    /// Lector de cola sobre una descarga en curso, si la hay. Devuelve
    /// `None` tanto si no hay descarga como si acaba de sellarse; en ese
    /// caso `lookup` encontrará la entrada final.
    pub fn tail_pending(&self, backend: &str, id: &str, container: &str) -> Option<TailReader> {
        let key = Self::key(backend, id);
        let entry = self.pending.get(&key)?.clone();
        let file = std::fs::File::open(&entry.temp_path).ok()?;
        Some(TailReader::new(
            entry,
            tokio::fs::File::from_std(file),
            container,
        ))
    }

    /// Inicia una escritura atómica para la pista. Falla con
    /// `AlreadyExists` si otra descarga de la misma clave está en curso.
    pub fn begin(
        &self,
        backend: &str,
        id: &str,
        ext: &str,
        expected: Option<u64>,
    ) -> io::Result<CacheWriter> {
        let key = Self::key(backend, id);
        let dest = self.entry_path(&key, ext);

        let temp = NamedTempFile::new_in(&self.dir)?;
        let entry = Arc::new(PendingEntry {
            temp_path: temp.path().to_path_buf(),
            written: AtomicU64::new(0),
            expected,
            state: AtomicU8::new(PENDING_ACTIVE),
            notify: Notify::new(),
        });

        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "descarga ya en curso para esta clave",
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        let file = match temp.as_file().try_clone() {
            Ok(f) => tokio::fs::File::from_std(f),
            Err(e) => {
                self.pending.remove(&key);
                return Err(e);
            }
        };

        Ok(CacheWriter {
            key,
            dest,
            file,
            temp: Some(temp),
            entry,
            pending: self.pending.clone(),
        })
    }

    /// Barrido de mantenimiento: borra entradas con más edad que `max_age`.
    pub async fn sweep_older_than(&self, max_age: Duration) -> io::Result<usize> {
        let mut removed = 0usize;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified.elapsed().unwrap_or_default() > max_age
                && tokio::fs::remove_file(entry.path()).await.is_ok()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("🧹 Caché: {} entradas antiguas eliminadas", removed);
        }
        Ok(removed)
    }
}

/// Escritura en curso de una entrada de caché.
pub struct CacheWriter {
    key: String,
    dest: PathBuf,
    file: tokio::fs::File,
    temp: Option<NamedTempFile>,
    entry: Arc<PendingEntry>,
    pending: Arc<DashMap<String, Arc<PendingEntry>>>,
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("key", &self.key)
            .field("dest", &self.dest)
            .finish_non_exhaustive()
    }
}

impl CacheWriter {
    /// Ruta final que tendrá la entrada al sellarse.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn entry(&self) -> Arc<PendingEntry> {
        self.entry.clone()
    }

    /// Lector paralelo de la misma entrada mientras se descarga.
    pub fn tail_reader(&self, container: &str) -> io::Result<TailReader> {
        let Some(temp) = self.temp.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "entrada ya sellada"));
        };
        Ok(TailReader::new(
            self.entry.clone(),
            tokio::fs::File::from_std(temp.reopen()?),
            container,
        ))
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        // El flush hace visibles los bytes a los lectores de cola antes de
        // publicar el avance del contador.
        self.file.flush().await?;
        self.entry
            .written
            .fetch_add(chunk.len() as u64, Ordering::Release);
        self.entry.notify.notify_waiters();
        Ok(())
    }

    /// Sella la entrada: vuelca a disco y la renombra a su nombre final.
    pub async fn finish(mut self) -> io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        if let Some(temp) = self.temp.take() {
            temp.persist(&self.dest).map_err(|e| e.error)?;
        }

        self.entry.state.store(PENDING_DONE, Ordering::Release);
        self.entry.notify.notify_waiters();
        self.pending.remove(&self.key);

        debug!("💾 Entrada de caché sellada: {}", self.dest.display());
        Ok(self.dest.clone())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // Sin finish(): descarga fallida, el temporal se borra solo.
        if self.temp.is_some() {
            self.entry.state.store(PENDING_FAILED, Ordering::Release);
            self.entry.notify.notify_waiters();
            self.pending.remove(&self.key);
        }
    }
}

/// Lector de cola sobre una entrada aún descargándose. Bloquea en el
/// límite escrito hasta que el escritor avance o termine.
pub struct TailReader {
    entry: Arc<PendingEntry>,
    state: Mutex<TailState>,
    container: String,
}

struct TailState {
    file: tokio::fs::File,
    pos: u64,
}

impl TailReader {
    fn new(entry: Arc<PendingEntry>, file: tokio::fs::File, container: &str) -> Self {
        Self {
            entry,
            state: Mutex::new(TailState { file, pos: 0 }),
            container: container.to_string(),
        }
    }
}

#[async_trait]
impl MediaStream for TailReader {
    async fn read_chunk(&self) -> io::Result<Bytes> {
        let mut st = self.state.lock().await;

        let available = self.entry.wait_past(st.pos).await;
        if self.entry.is_failed() {
            return Err(io::Error::other("la descarga de la entrada falló"));
        }
        if available <= st.pos {
            return Ok(Bytes::new());
        }

        let want = ((available - st.pos) as usize).min(TAIL_READ_MAX);
        let mut buf = vec![0u8; want];
        let pos = st.pos;
        st.file.seek(SeekFrom::Start(pos)).await?;
        st.file.read_exact(&mut buf).await?;
        st.pos += want as u64;
        Ok(Bytes::from(buf))
    }

    async fn seek(&self, offset: u64) -> io::Result<u64> {
        let mut st = self.state.lock().await;
        st.pos = offset;
        Ok(offset)
    }

    fn byte_len(&self) -> Option<u64> {
        self.entry.expected.or_else(|| {
            self.entry
                .is_done()
                .then(|| self.entry.written())
        })
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn container_hint(&self) -> Option<String> {
        Some(self.container.clone())
    }
}
