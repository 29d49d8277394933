//! Desencriptado de streams entregados por chunks.
//!
//! El servicio lossless sirve el audio en chunks de tamaño fijo donde solo
//! la cabecera de cada chunk viaja encriptada (Blowfish-CBC con IV fijo y
//! clave por pista). Como el IV se reinicia en cada chunk, el stream admite
//! acceso aleatorio alineado a chunk y la reconexión tras un corte de red es
//! una simple petición con `Range` en el offset del chunk pendiente.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::BackendError;
use crate::track::stream::MediaStream;

/// Tamaño fijo de chunk del formato de entrega.
pub const CHUNK_SIZE: usize = 6144;
/// Bytes encriptados al frente de cada chunk suficientemente grande.
pub const ENCRYPTED_HEAD: usize = 2048;
/// IV fijo del esquema; se reinicia en cada chunk.
const STRIPE_IV: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
/// Reconexiones por chunk antes de rendirse.
const MAX_RECONNECTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(150);

type HeadDecryptor = cbc::Decryptor<blowfish::Blowfish>;

/// Conexión abierta contra el upstream, leída secuencialmente.
#[async_trait]
pub trait ChunkStream: Send + Sync {
    /// Lee hasta llenar `buf`; Ok(0) = el upstream no tiene más bytes.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Longitud total del recurso si la respuesta la declaró.
    fn total_len(&self) -> Option<u64>;
}

/// Abre conexiones con soporte de rangos contra el upstream.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn open(&self, url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, BackendError>;
}

/// Entrega una URL firmada fresca cuando la original venció antes de servir
/// su primer chunk.
#[async_trait]
pub trait UrlRenewer: Send + Sync {
    async fn renew(&self) -> Result<String, BackendError>;
}

/// Fetcher real sobre reqwest.
pub struct HttpChunkFetcher {
    client: reqwest::Client,
}

impl HttpChunkFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn open(&self, url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, BackendError> {
        let mut req = self.client.get(url);
        if offset > 0 {
            req = req.header(RANGE, format!("bytes={offset}-"));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::GONE {
            return Err(BackendError::Unavailable(format!(
                "URL firmada rechazada ({status})"
            )));
        }
        if !status.is_success() {
            return Err(BackendError::Network(format!("upstream respondió {status}")));
        }

        let total = total_from_headers(resp.headers(), offset, resp.content_length());
        Ok(Box::new(HttpChunkStream {
            resp,
            pending: Bytes::new(),
            total,
        }))
    }
}

/// Longitud total del recurso según `Content-Range`, o `Content-Length`
/// más el offset pedido en respuestas sin rango.
fn total_from_headers(headers: &HeaderMap, offset: u64, content_length: Option<u64>) -> Option<u64> {
    if let Some(range) = headers.get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        if let Some(total) = range.rsplit('/').next().and_then(|t| t.trim().parse::<u64>().ok()) {
            return Some(total);
        }
    }
    content_length.map(|len| offset + len)
}

struct HttpChunkStream {
    resp: reqwest::Response,
    pending: Bytes,
    total: Option<u64>,
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.resp.chunk().await {
                Ok(Some(bytes)) => self.pending = bytes,
                Ok(None) => return Ok(0),
                Err(e) => return Err(io::Error::other(e)),
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    fn total_len(&self) -> Option<u64> {
        self.total
    }
}

/// Stream encriptado por chunks, desencriptado en el camino de lectura.
///
/// Garantías: las reconexiones son transparentes (ni pérdida ni duplicado
/// de bytes, porque un chunk se entrega solo cuando se leyó completo), y el
/// fallo persistente del primer chunk gasta una única renovación de URL
/// firmada antes de rendirse.
pub struct ChunkedDecryptor {
    fetcher: Arc<dyn ChunkFetcher>,
    renewer: Option<Arc<dyn UrlRenewer>>,
    key: Vec<u8>,
    container: String,
    state: Mutex<DecryptorState>,
    total: OnceLock<u64>,
}

struct DecryptorState {
    url: String,
    conn: Option<Box<dyn ChunkStream>>,
    /// Próximo byte absoluto que verá el consumidor.
    position: u64,
    /// Ya se entregó al menos un chunk; bloquea la renovación de URL.
    delivered: bool,
    /// La renovación única ya se gastó.
    renewed: bool,
}

impl ChunkedDecryptor {
    pub fn new(
        url: String,
        key: Vec<u8>,
        container: impl Into<String>,
        fetcher: Arc<dyn ChunkFetcher>,
        renewer: Option<Arc<dyn UrlRenewer>>,
    ) -> Self {
        Self {
            fetcher,
            renewer,
            key,
            container: container.into(),
            state: Mutex::new(DecryptorState {
                url,
                conn: None,
                position: 0,
                delivered: false,
                renewed: false,
            }),
            total: OnceLock::new(),
        }
    }

    /// Abre la conexión inicial sin consumir bytes, de modo que los fallos
    /// de disponibilidad aparezcan al resolver la pista y no a mitad del
    /// render.
    pub async fn prime(&self) -> Result<(), BackendError> {
        let mut st = self.state.lock().await;
        self.ensure_conn(&mut st).await
    }

    /// Tamaño que declaró la API, por si el upstream no manda cabeceras
    /// de longitud utilizables. El total se fija una sola vez: quien
    /// llegue primero (este aviso o las cabeceras) gana.
    pub fn set_total_hint(&self, total: u64) {
        let _ = self.total.set(total);
    }

    /// Establece la conexión en el límite del chunk pendiente, con
    /// reintentos acotados y la renovación de URL si corresponde.
    async fn ensure_conn(&self, st: &mut DecryptorState) -> Result<(), BackendError> {
        if st.conn.is_some() {
            return Ok(());
        }

        let mut attempts = 0u32;
        loop {
            match self.reopen_at_chunk(st).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts > MAX_RECONNECTS {
                        if self.try_renew(st, &e).await? {
                            attempts = 0;
                            continue;
                        }
                        return Err(e);
                    }
                    debug!("Reabriendo upstream ({attempts}/{MAX_RECONNECTS}): {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn reopen_at_chunk(&self, st: &mut DecryptorState) -> Result<(), BackendError> {
        let chunk_start = st.position - st.position % CHUNK_SIZE as u64;
        let conn = self.fetcher.open(&st.url, chunk_start).await?;
        if let Some(total) = conn.total_len() {
            let _ = self.total.set(total);
        }
        st.conn = Some(conn);
        Ok(())
    }

    /// Gasta la única renovación de URL. Solo aplica mientras el stream no
    /// haya servido su primer chunk; devuelve true si hay URL nueva.
    async fn try_renew(
        &self,
        st: &mut DecryptorState,
        cause: &BackendError,
    ) -> Result<bool, BackendError> {
        if st.delivered || st.renewed {
            return Ok(false);
        }
        let Some(renewer) = self.renewer.as_ref() else {
            return Ok(false);
        };

        warn!("🔄 Renovando URL firmada tras fallo inicial: {cause}");
        let fresh = renewer.renew().await?;
        st.url = fresh;
        st.renewed = true;
        st.conn = None;
        Ok(true)
    }

    /// Lee, desencripta y entrega el chunk pendiente completo. Un resultado
    /// vacío señala el fin del stream.
    async fn next_chunk(&self) -> Result<Bytes, BackendError> {
        let mut st = self.state.lock().await;

        if let Some(total) = self.total.get() {
            if st.position >= *total {
                return Ok(Bytes::new());
            }
        }

        let chunk_start = st.position - st.position % CHUNK_SIZE as u64;
        let mut attempts = 0u32;

        loop {
            self.ensure_conn(&mut st).await?;

            let read = match st.conn.as_mut() {
                Some(conn) => read_full(conn.as_mut(), CHUNK_SIZE).await,
                None => continue,
            };

            let mut chunk = match read {
                Ok(c) => c,
                Err(e) => {
                    st.conn = None;
                    attempts += 1;
                    if attempts > MAX_RECONNECTS {
                        let cause = BackendError::Network(e.to_string());
                        if self.try_renew(&mut st, &cause).await? {
                            attempts = 0;
                            continue;
                        }
                        return Err(BackendError::Network(format!(
                            "reconexiones agotadas en offset {chunk_start}: {e}"
                        )));
                    }
                    debug!(
                        "Conexión perdida, reintento {attempts}/{MAX_RECONNECTS} desde offset {chunk_start}: {e}"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let got = chunk.len();

            if got == 0 {
                if let Some(total) = self.total.get() {
                    if chunk_start < *total {
                        // El upstream cerró antes del final declarado.
                        st.conn = None;
                        attempts += 1;
                        if attempts > MAX_RECONNECTS {
                            return Err(BackendError::Network(format!(
                                "upstream truncado en offset {chunk_start}"
                            )));
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
                let _ = self.total.set(chunk_start);
                return Ok(Bytes::new());
            }

            if got < CHUNK_SIZE {
                let end = chunk_start + got as u64;
                if let Some(total) = self.total.get() {
                    if end < (*total).min(chunk_start + CHUNK_SIZE as u64) {
                        // Chunk incompleto con bytes aún pendientes.
                        st.conn = None;
                        attempts += 1;
                        if attempts > MAX_RECONNECTS {
                            return Err(BackendError::Network(format!(
                                "chunk incompleto en offset {chunk_start}"
                            )));
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
                // Chunk final corto: fija la longitud real del recurso.
                let _ = self.total.set(end);
            }

            if got >= ENCRYPTED_HEAD {
                self.decrypt_head(&mut chunk)?;
            }

            let skip = (st.position - chunk_start) as usize;
            st.position = chunk_start + got as u64;
            st.delivered = true;

            if skip >= got {
                // Seek más allá del final real del recurso.
                return Ok(Bytes::new());
            }

            let bytes = Bytes::from(chunk);
            return Ok(if skip == 0 { bytes } else { bytes.slice(skip..) });
        }
    }

    fn decrypt_head(&self, chunk: &mut [u8]) -> Result<(), BackendError> {
        let head = &mut chunk[..ENCRYPTED_HEAD];
        let cipher = HeadDecryptor::new_from_slices(&self.key, &STRIPE_IV)
            .map_err(|e| BackendError::Decrypt(format!("clave inválida: {e}")))?;
        cipher
            .decrypt_padded_mut::<NoPadding>(head)
            .map_err(|e| BackendError::Decrypt(format!("cabecera de chunk corrupta: {e}")))?;
        Ok(())
    }
}

/// Acumula hasta `want` bytes de la conexión; corta en el EOF del upstream.
async fn read_full(conn: &mut dyn ChunkStream, want: usize) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = conn.read(&mut out[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    out.truncate(filled);
    Ok(out)
}

#[async_trait]
impl MediaStream for ChunkedDecryptor {
    async fn read_chunk(&self) -> io::Result<Bytes> {
        self.next_chunk().await.map_err(io::Error::other)
    }

    async fn seek(&self, offset: u64) -> io::Result<u64> {
        let mut st = self.state.lock().await;
        let clamped = match self.total.get() {
            Some(total) => offset.min(*total),
            None => offset,
        };
        // La próxima lectura reabre alineada al chunk que contiene el offset.
        st.conn = None;
        st.position = clamped;
        Ok(clamped)
    }

    fn byte_len(&self) -> Option<u64> {
        self.total.get().copied()
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn container_hint(&self) -> Option<String> {
        Some(self.container.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type HeadEncryptor = cbc::Encryptor<blowfish::Blowfish>;

    const TEST_KEY: &[u8] = b"clave-de-prueba!";

    /// Encripta un cuerpo plano igual que el upstream: la cabecera de cada
    /// chunk suficientemente grande en Blowfish-CBC con el IV fijo.
    fn stripe_encrypt(plain: &[u8], key: &[u8]) -> Vec<u8> {
        let mut out = plain.to_vec();
        let mut offset = 0;
        while offset < out.len() {
            let end = (offset + CHUNK_SIZE).min(out.len());
            if end - offset >= ENCRYPTED_HEAD {
                let head = &mut out[offset..offset + ENCRYPTED_HEAD];
                HeadEncryptor::new_from_slices(key, &STRIPE_IV)
                    .unwrap()
                    .encrypt_padded_mut::<NoPadding>(head, ENCRYPTED_HEAD)
                    .unwrap();
            }
            offset = end;
        }
        out
    }

    fn sample_plain(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    async fn read_all(dec: &ChunkedDecryptor) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = dec.read_chunk().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Upstream en memoria; corta la primera conexión tras N bytes si se
    /// lo configura.
    struct FlakyFetcher {
        body: Vec<u8>,
        cut_after: std::sync::Mutex<Option<usize>>,
        opens: AtomicUsize,
    }

    impl FlakyFetcher {
        fn new(body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                body,
                cut_after: std::sync::Mutex::new(None),
                opens: AtomicUsize::new(0),
            })
        }

        fn cut_first_conn_after(self: &Arc<Self>, bytes: usize) {
            *self.cut_after.lock().unwrap() = Some(bytes);
        }
    }

    #[async_trait]
    impl ChunkFetcher for FlakyFetcher {
        async fn open(&self, _url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, BackendError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let cut = self.cut_after.lock().unwrap().take();
            Ok(Box::new(FlakyStream {
                body: self.body.clone(),
                pos: offset as usize,
                before_cut: cut,
            }))
        }
    }

    struct FlakyStream {
        body: Vec<u8>,
        pos: usize,
        before_cut: Option<usize>,
    }

    #[async_trait]
    impl ChunkStream for FlakyStream {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(0) = self.before_cut {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "corte simulado",
                ));
            }
            if self.pos >= self.body.len() {
                return Ok(0);
            }
            let mut n = buf.len().min(self.body.len() - self.pos);
            if let Some(rem) = self.before_cut {
                n = n.min(rem);
            }
            buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
            self.pos += n;
            if let Some(rem) = &mut self.before_cut {
                *rem -= n;
            }
            Ok(n)
        }

        fn total_len(&self) -> Option<u64> {
            Some(self.body.len() as u64)
        }
    }

    /// Fetcher que solo acepta una URL concreta.
    struct UrlGatedFetcher {
        body: Vec<u8>,
        valid: &'static str,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl ChunkFetcher for UrlGatedFetcher {
        async fn open(&self, url: &str, offset: u64) -> Result<Box<dyn ChunkStream>, BackendError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if url != self.valid {
                return Err(BackendError::Unavailable("URL vencida".into()));
            }
            Ok(Box::new(FlakyStream {
                body: self.body.clone(),
                pos: offset as usize,
                before_cut: None,
            }))
        }
    }

    struct CountingRenewer {
        fresh: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UrlRenewer for CountingRenewer {
        async fn renew(&self) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.fresh.to_string())
        }
    }

    #[tokio::test]
    async fn test_desencripta_cuerpo_completo() {
        let plain = sample_plain(CHUNK_SIZE * 3 + CHUNK_SIZE / 2);
        let fetcher = FlakyFetcher::new(stripe_encrypt(&plain, TEST_KEY));
        let dec = ChunkedDecryptor::new(
            "http://upstream/pista".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher.clone(),
            None,
        );

        assert_eq!(read_all(&dec).await, plain);
        assert_eq!(fetcher.opens.load(Ordering::SeqCst), 1);
        assert_eq!(dec.byte_len(), Some(plain.len() as u64));
    }

    #[tokio::test]
    async fn test_chunk_final_corto_pasa_sin_desencriptar() {
        // El resto final es más corto que la cabecera encriptada.
        let plain = sample_plain(CHUNK_SIZE + ENCRYPTED_HEAD / 4);
        let fetcher = FlakyFetcher::new(stripe_encrypt(&plain, TEST_KEY));
        let dec = ChunkedDecryptor::new(
            "http://upstream/pista".into(),
            TEST_KEY.to_vec(),
            "mp3",
            fetcher,
            None,
        );

        assert_eq!(read_all(&dec).await, plain);
    }

    #[tokio::test]
    async fn test_reconexion_idempotente() {
        let plain = sample_plain(CHUNK_SIZE * 4);
        let body = stripe_encrypt(&plain, TEST_KEY);

        let fetcher = FlakyFetcher::new(body);
        fetcher.cut_first_conn_after(CHUNK_SIZE + 700);
        let dec = ChunkedDecryptor::new(
            "http://upstream/pista".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher.clone(),
            None,
        );

        // Byte a byte igual que un upstream que nunca falla.
        assert_eq!(read_all(&dec).await, plain);
        assert_eq!(fetcher.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corte_en_el_primer_chunk_reconecta_sin_renovar() {
        let plain = sample_plain(CHUNK_SIZE * 2);
        let fetcher = FlakyFetcher::new(stripe_encrypt(&plain, TEST_KEY));
        fetcher.cut_first_conn_after(1000);
        let renewer = Arc::new(CountingRenewer {
            fresh: "http://upstream/fresca",
            calls: AtomicUsize::new(0),
        });
        let dec = ChunkedDecryptor::new(
            "http://upstream/pista".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher,
            Some(renewer.clone()),
        );

        assert_eq!(read_all(&dec).await, plain);
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_renueva_url_cuando_el_primer_chunk_nunca_llega() {
        let plain = sample_plain(CHUNK_SIZE * 2);
        let fetcher = Arc::new(UrlGatedFetcher {
            body: stripe_encrypt(&plain, TEST_KEY),
            valid: "http://upstream/fresca",
            opens: AtomicUsize::new(0),
        });
        let renewer = Arc::new(CountingRenewer {
            fresh: "http://upstream/fresca",
            calls: AtomicUsize::new(0),
        });
        let dec = ChunkedDecryptor::new(
            "http://upstream/vencida".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher,
            Some(renewer.clone()),
        );

        assert_eq!(read_all(&dec).await, plain);
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reintentos_agotados_sin_renovador() {
        let fetcher = Arc::new(UrlGatedFetcher {
            body: Vec::new(),
            valid: "http://upstream/otra",
            opens: AtomicUsize::new(0),
        });
        let dec = ChunkedDecryptor::new(
            "http://upstream/vencida".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher.clone(),
            None,
        );

        let err = dec.next_chunk().await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert_eq!(fetcher.opens.load(Ordering::SeqCst), 1 + MAX_RECONNECTS as usize);
    }

    #[tokio::test]
    async fn test_seek_dentro_y_fuera_del_chunk() {
        let plain = sample_plain(CHUNK_SIZE * 3);
        let fetcher = FlakyFetcher::new(stripe_encrypt(&plain, TEST_KEY));
        let dec = ChunkedDecryptor::new(
            "http://upstream/pista".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher,
            None,
        );

        // A mitad del segundo chunk.
        let target = CHUNK_SIZE as u64 + 123;
        assert_eq!(dec.seek(target).await.unwrap(), target);
        assert_eq!(read_all(&dec).await, &plain[target as usize..]);

        // De vuelta al principio.
        assert_eq!(dec.seek(0).await.unwrap(), 0);
        assert_eq!(read_all(&dec).await, plain);
    }

    #[tokio::test]
    async fn test_eof_exacto_en_limite_de_chunk() {
        let plain = sample_plain(CHUNK_SIZE * 2);
        let fetcher = FlakyFetcher::new(stripe_encrypt(&plain, TEST_KEY));
        let dec = ChunkedDecryptor::new(
            "http://upstream/pista".into(),
            TEST_KEY.to_vec(),
            "flac",
            fetcher,
            None,
        );

        assert_eq!(read_all(&dec).await, plain);
        // Otra lectura tras el EOF sigue devolviendo vacío.
        assert!(dec.read_chunk().await.unwrap().is_empty());
    }

    #[test]
    fn test_total_desde_cabeceras() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, "bytes 6144-99999/100000".parse().unwrap());
        assert_eq!(total_from_headers(&headers, 6144, Some(93856)), Some(100_000));

        let headers = HeaderMap::new();
        assert_eq!(total_from_headers(&headers, 6144, Some(1000)), Some(7144));
        assert_eq!(total_from_headers(&headers, 0, None), None);
    }
}
