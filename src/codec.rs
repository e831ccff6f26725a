//! Encoding-aware streaming body transforms
//!
//! Response bodies flow through a chain of [`BodyTransform`] stages
//! (decompress, rewrite, recompress) chunk by chunk, so a body of any length
//! is processed in bounded memory. Codecs are driven through their write-side
//! adapters into a shared output buffer; the compressor flushes after every
//! chunk so output is available incrementally and finalizes the stream on EOF
//! to emit any trailer.
//!
//! Supported encodings: `gzip`, `deflate`, `br`, `zstd`; the empty label and
//! `identity` are pass-through.

use std::io::{self, Write};
use std::sync::Arc;

use axum::body::Body;
use brotli::{CompressorWriter, DecompressorWriter};
use bytes::Bytes;
use flate2::write::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder};
use flate2::Compression;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;

use crate::rate_limit::MultiRateLimiter;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 4;
const BROTLI_LGWIN: u32 = 22;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
#[error("unsupported encoding: {0}")]
pub struct UnsupportedEncoding(pub String);

/// One stage of a streaming body rewrite pipeline.
///
/// `update` consumes the next input chunk and returns whatever output is
/// available so far; `finish` is called once after the last chunk and returns
/// the remaining output (codec trailers, retained padding).
pub trait BodyTransform: Send {
    fn update(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>>;
    fn finish(&mut self) -> io::Result<Vec<u8>>;
}

pub type BoxedTransform = Box<dyn BodyTransform>;

/// Body encoding label as carried by `Content-Encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl Encoding {
    pub fn parse(label: &str) -> Result<Self, UnsupportedEncoding> {
        match label {
            "" | "identity" => Ok(Encoding::Identity),
            "gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            "br" => Ok(Encoding::Brotli),
            "zstd" => Ok(Encoding::Zstd),
            other => Err(UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Shared sink the codec writers emit into; drained after every chunk.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum DecodeWriter {
    Identity,
    Gzip(Option<GzDecoder<SharedBuf>>),
    Deflate(Option<DeflateDecoder<SharedBuf>>),
    Brotli(Option<Box<DecompressorWriter<SharedBuf>>>),
    Zstd(Option<zstd::stream::write::Decoder<'static, SharedBuf>>),
}

/// Streaming decoder for a response body.
pub struct Decompressor {
    writer: DecodeWriter,
    sink: SharedBuf,
}

impl Decompressor {
    pub fn new(encoding: Encoding) -> io::Result<Self> {
        let sink = SharedBuf::default();
        let writer = match encoding {
            Encoding::Identity => DecodeWriter::Identity,
            Encoding::Gzip => DecodeWriter::Gzip(Some(GzDecoder::new(sink.clone()))),
            Encoding::Deflate => DecodeWriter::Deflate(Some(DeflateDecoder::new(sink.clone()))),
            Encoding::Brotli => DecodeWriter::Brotli(Some(Box::new(DecompressorWriter::new(
                sink.clone(),
                BROTLI_BUFFER_SIZE,
            )))),
            Encoding::Zstd => {
                DecodeWriter::Zstd(Some(zstd::stream::write::Decoder::new(sink.clone())?))
            }
        };
        Ok(Self { writer, sink })
    }
}

impl BodyTransform for Decompressor {
    fn update(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.writer {
            DecodeWriter::Identity => return Ok(chunk.to_vec()),
            DecodeWriter::Gzip(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            DecodeWriter::Deflate(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            DecodeWriter::Brotli(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            DecodeWriter::Zstd(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            _ => return Err(io::Error::other("decoder already finished")),
        }
        Ok(self.sink.drain())
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.writer {
            DecodeWriter::Identity => {}
            DecodeWriter::Gzip(w) => {
                if let Some(w) = w.take() {
                    w.finish()?;
                }
            }
            DecodeWriter::Deflate(w) => {
                if let Some(w) = w.take() {
                    w.finish()?;
                }
            }
            DecodeWriter::Brotli(w) => {
                // drop closes the stream, flushing into the shared sink
                drop(w.take());
            }
            DecodeWriter::Zstd(w) => {
                if let Some(mut w) = w.take() {
                    w.flush()?;
                }
            }
        }
        Ok(self.sink.drain())
    }
}

enum EncodeWriter {
    Identity,
    Gzip(Option<GzEncoder<SharedBuf>>),
    Deflate(Option<DeflateEncoder<SharedBuf>>),
    Brotli(Option<Box<CompressorWriter<SharedBuf>>>),
    Zstd(Option<zstd::stream::write::Encoder<'static, SharedBuf>>),
}

/// Streaming re-encoder that preserves the original `Content-Encoding`.
pub struct Compressor {
    writer: EncodeWriter,
    sink: SharedBuf,
}

impl Compressor {
    pub fn new(encoding: Encoding) -> io::Result<Self> {
        let sink = SharedBuf::default();
        let writer = match encoding {
            Encoding::Identity => EncodeWriter::Identity,
            Encoding::Gzip => {
                EncodeWriter::Gzip(Some(GzEncoder::new(sink.clone(), Compression::default())))
            }
            Encoding::Deflate => EncodeWriter::Deflate(Some(DeflateEncoder::new(
                sink.clone(),
                Compression::default(),
            ))),
            Encoding::Brotli => EncodeWriter::Brotli(Some(Box::new(CompressorWriter::new(
                sink.clone(),
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            )))),
            Encoding::Zstd => EncodeWriter::Zstd(Some(zstd::stream::write::Encoder::new(
                sink.clone(),
                ZSTD_LEVEL,
            )?)),
        };
        Ok(Self { writer, sink })
    }
}

impl BodyTransform for Compressor {
    fn update(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.writer {
            EncodeWriter::Identity => return Ok(chunk.to_vec()),
            EncodeWriter::Gzip(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            EncodeWriter::Deflate(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            EncodeWriter::Brotli(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            EncodeWriter::Zstd(Some(w)) => {
                w.write_all(chunk)?;
                w.flush()?;
            }
            _ => return Err(io::Error::other("encoder already finished")),
        }
        Ok(self.sink.drain())
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.writer {
            EncodeWriter::Identity => {}
            EncodeWriter::Gzip(w) => {
                if let Some(w) = w.take() {
                    w.finish()?;
                }
            }
            EncodeWriter::Deflate(w) => {
                if let Some(w) = w.take() {
                    w.finish()?;
                }
            }
            EncodeWriter::Brotli(w) => {
                // drop finalizes the brotli stream into the shared sink
                drop(w.take());
            }
            EncodeWriter::Zstd(w) => {
                if let Some(w) = w.take() {
                    w.finish()?;
                }
            }
        }
        Ok(self.sink.drain())
    }
}

/// Feed one chunk through every stage in order.
pub fn apply_chain(transforms: &mut [BoxedTransform], chunk: &[u8]) -> io::Result<Vec<u8>> {
    let mut data = chunk.to_vec();
    for transform in transforms.iter_mut() {
        data = transform.update(&data)?;
    }
    Ok(data)
}

/// Finish every stage in order, cascading each stage's tail through the
/// stages after it.
pub fn finish_chain(transforms: &mut [BoxedTransform]) -> io::Result<Vec<u8>> {
    let mut carry: Vec<u8> = Vec::new();
    for i in 0..transforms.len() {
        let mut produced = if carry.is_empty() {
            Vec::new()
        } else {
            transforms[i].update(&carry)?
        };
        produced.extend(transforms[i].finish()?);
        carry = produced;
    }
    Ok(carry)
}

/// Wrap a body stream with a transform chain and an optional traffic limiter.
///
/// The limiter is charged for the bytes read from the wire (pre-transform),
/// after each chunk arrives. An empty chain with no limiter is a plain
/// re-wrap.
pub fn wrap_body<S, E>(
    stream: S,
    transforms: Vec<BoxedTransform>,
    limiter: Option<Arc<MultiRateLimiter>>,
) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + Sync + 'static,
{
    struct State<S> {
        inner: S,
        transforms: Vec<BoxedTransform>,
        limiter: Option<Arc<MultiRateLimiter>>,
        finished: bool,
    }

    let state = State {
        inner: Box::pin(stream),
        transforms,
        limiter,
        finished: false,
    };

    let out = futures_util::stream::try_unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return Ok::<_, io::Error>(None);
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    if let Some(limiter) = &st.limiter {
                        if !chunk.is_empty() {
                            limiter
                                .wait_n(chunk.len())
                                .await
                                .map_err(io::Error::other)?;
                        }
                    }
                    let out = apply_chain(&mut st.transforms, &chunk)?;
                    if out.is_empty() {
                        continue;
                    }
                    return Ok(Some((Bytes::from(out), st)));
                }
                Some(Err(e)) => return Err(io::Error::other(e.to_string())),
                None => {
                    st.finished = true;
                    let out = finish_chain(&mut st.transforms)?;
                    if out.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some((Bytes::from(out), st)));
                }
            }
        }
    });

    Body::from_stream(out)
}
