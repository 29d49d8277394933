use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use symphonia::core::io::MediaSource;
use tokio::runtime::Handle;

/// Fuente de audio remota leída por chunks desde el runtime async.
///
/// La implementan el desencriptador por chunks, el lector de cola de caché
/// y cualquier stream directo que el render deba consumir en vivo.
#[async_trait]
pub trait MediaStream: Send + Sync {
    /// Siguiente bloque de bytes ya desencriptados. Vacío = fin del stream.
    async fn read_chunk(&self) -> io::Result<Bytes>;

    /// Reposiciona el stream en un offset absoluto en bytes.
    async fn seek(&self, offset: u64) -> io::Result<u64>;

    /// Longitud total en bytes si el backend la informó.
    fn byte_len(&self) -> Option<u64>;

    fn is_seekable(&self) -> bool;

    /// Pista de contenedor para el probe ("mp3", "flac"...).
    fn container_hint(&self) -> Option<String> {
        None
    }
}

/// Puente síncrono entre un [`MediaStream`] y el decodificador de songbird.
///
/// Los hilos del driver leen con `Read`/`Seek`; cuando el resto del último
/// chunk se agota, la lectura entra al runtime con `block_on`. Solo debe
/// usarse desde hilos ajenos al runtime — los del mixer y el probe lo son.
pub struct StreamReader {
    stream: Arc<dyn MediaStream>,
    rt: Handle,
    leftover: Bytes,
    pos: u64,
    eof: bool,
}

impl StreamReader {
    pub fn new(stream: Arc<dyn MediaStream>, rt: Handle) -> Self {
        Self {
            stream,
            rt,
            leftover: Bytes::new(),
            pos: 0,
            eof: false,
        }
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            if self.eof {
                return Ok(0);
            }
            let chunk = self.rt.block_on(self.stream.read_chunk())?;
            if chunk.is_empty() {
                self.eof = true;
                return Ok(0);
            }
            self.leftover = chunk;
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover.split_to(n));
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for StreamReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
            SeekFrom::End(d) => match self.stream.byte_len() {
                Some(len) => i128::from(len) + i128::from(d),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "longitud del stream desconocida",
                    ))
                }
            },
        };

        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset negativo",
            ));
        }
        let target = target as u64;

        // Consulta de posición (Current(0)) y seeks al punto actual no
        // tocan el stream.
        if target == self.pos {
            return Ok(self.pos);
        }

        if !self.stream.is_seekable() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream no posicionable",
            ));
        }

        let reached = self.rt.block_on(self.stream.seek(target))?;
        self.leftover = Bytes::new();
        self.eof = false;
        self.pos = reached;
        Ok(reached)
    }
}

impl MediaSource for StreamReader {
    fn is_seekable(&self) -> bool {
        self.stream.is_seekable()
    }

    fn byte_len(&self) -> Option<u64> {
        self.stream.byte_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Stream en memoria que entrega el contenido en bloques fijos.
    struct MemoryStream {
        data: Vec<u8>,
        chunk: usize,
        pos: Mutex<u64>,
    }

    impl MemoryStream {
        fn new(data: Vec<u8>, chunk: usize) -> Arc<Self> {
            Arc::new(Self {
                data,
                chunk,
                pos: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl MediaStream for MemoryStream {
        async fn read_chunk(&self) -> io::Result<Bytes> {
            let mut pos = self.pos.lock().await;
            let start = *pos as usize;
            if start >= self.data.len() {
                return Ok(Bytes::new());
            }
            let end = (start + self.chunk).min(self.data.len());
            *pos = end as u64;
            Ok(Bytes::copy_from_slice(&self.data[start..end]))
        }

        async fn seek(&self, offset: u64) -> io::Result<u64> {
            let mut pos = self.pos.lock().await;
            *pos = offset.min(self.data.len() as u64);
            Ok(*pos)
        }

        fn byte_len(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn is_seekable(&self) -> bool {
            true
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_lectura_completa() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let data = body(10_000);
        let mut reader = StreamReader::new(MemoryStream::new(data.clone(), 1024), rt.handle().clone());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_seek_absoluto_y_relativo() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let data = body(5_000);
        let mut reader = StreamReader::new(MemoryStream::new(data.clone(), 512), rt.handle().clone());

        let mut head = [0u8; 100];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(reader.seek(SeekFrom::Current(0)).unwrap(), 100);

        let p = reader.seek(SeekFrom::Start(4_000)).unwrap();
        assert_eq!(p, 4_000);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[4_000..]);

        let p = reader.seek(SeekFrom::End(-500)).unwrap();
        assert_eq!(p, 4_500);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[4_500..]);
    }

    #[test]
    fn test_byte_len_reportado() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let reader = StreamReader::new(MemoryStream::new(body(777), 64), rt.handle().clone());
        assert_eq!(MediaSource::byte_len(&reader), Some(777));
        assert!(MediaSource::is_seekable(&reader));
    }
}
