use std::sync::atomic::{AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{remap::RemapError, DecodeFailure, DecodeStage};

/// Target shape for [`crate::Response::decode`].
///
/// The fast path uses the type's `serde` contract. When that rejects the body,
/// the lenient path parses a generic [`Value`] and calls [`Decode::remap`],
/// which should read fields one by one and default missing optionals
/// (see [`crate::remap::Fields`]).
pub trait Decode: DeserializeOwned + Send + Sync + 'static {
    fn remap(value: &Value) -> Result<Self, RemapError>;
}

impl Decode for Value {
    fn remap(value: &Value) -> Result<Self, RemapError> {
        Ok(value.clone())
    }
}

/// Parse counters shared by every response of one fetcher.
#[derive(Debug, Default)]
pub struct DecodeStats {
    fast_parses: AtomicUsize,
    fallback_parses: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl DecodeStats {
    /// Bodies handed to the `simd-json` decoder.
    pub fn fast_parses(&self) -> usize {
        self.fast_parses.load(Ordering::Relaxed)
    }

    /// Bodies handed to the lenient parser.
    pub fn fallback_parses(&self) -> usize {
        self.fallback_parses.load(Ordering::Relaxed)
    }

    /// Decodes answered from a response's decode slot.
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Total parse work performed, cache hits excluded.
    pub fn parses(&self) -> usize {
        self.fast_parses() + self.fallback_parses()
    }

    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Schema-driven decode through `simd-json`.
#[derive(Clone, Copy, Debug, Default)]
struct FastPath;

impl FastPath {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, String> {
        // simd-json parses in place.
        let mut scratch = body.to_vec();
        simd_json::serde::from_slice::<T>(&mut scratch).map_err(|err| err.to_string())
    }
}

/// Tolerant `serde_json` parse followed by [`Decode::remap`].
#[derive(Clone, Copy, Debug, Default)]
struct LenientPath;

impl LenientPath {
    fn decode<T: Decode>(&self, body: &[u8]) -> Result<T, String> {
        let value = parse_lenient(body)?;
        T::remap(&value).map_err(|err| err.to_string())
    }
}

/// Dual-path JSON decoder: fast first, lenient on failure.
#[derive(Debug)]
pub struct JsonDecoder {
    fast: FastPath,
    lenient: Option<LenientPath>,
    stats: DecodeStats,
}

impl Default for JsonDecoder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl JsonDecoder {
    pub fn new(lenient_fallback: bool) -> Self {
        Self {
            fast: FastPath,
            lenient: lenient_fallback.then_some(LenientPath),
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    /// Decodes `body` into `T` without any memoization.
    pub fn decode<T: Decode>(&self, body: &[u8]) -> Result<T, DecodeFailure> {
        self.stats.fast_parses.fetch_add(1, Ordering::Relaxed);
        let fast_err = match self.fast.decode::<T>(body) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(lenient) = self.lenient else {
            return Err(DecodeFailure {
                stage: DecodeStage::Fast,
                cause: fast_err,
            });
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            shape = std::any::type_name::<T>(),
            "fast decode failed, trying lenient parser: {fast_err}"
        );

        self.stats.fallback_parses.fetch_add(1, Ordering::Relaxed);
        lenient.decode::<T>(body).map_err(|cause| DecodeFailure {
            stage: DecodeStage::Fallback,
            cause,
        })
    }
}

/// Parses the first JSON value in `body`, tolerating a UTF-8 BOM, padding
/// whitespace or NUL bytes, a JSONP `callback(...)` wrapper and trailing
/// bytes after the value.
pub fn parse_lenient(body: &[u8]) -> Result<Value, String> {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    let body = strip_jsonp(trim_padding(body));

    let mut values = serde_json::Deserializer::from_slice(body).into_iter::<Value>();
    match values.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(err.to_string()),
        None => Err("empty body".to_owned()),
    }
}

fn trim_padding(body: &[u8]) -> &[u8] {
    let is_padding = |byte: &u8| byte.is_ascii_whitespace() || *byte == 0;
    let start = body.iter().position(|b| !is_padding(b)).unwrap_or(body.len());
    let end = body.iter().rposition(|b| !is_padding(b)).map_or(start, |i| i + 1);
    &body[start..end]
}

fn strip_jsonp(body: &[u8]) -> &[u8] {
    let Some(open) = body.iter().position(|b| *b == b'(') else {
        return body;
    };
    let callback = &body[..open];
    let is_callback = !callback.is_empty()
        && callback
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'.'));
    if !is_callback {
        return body;
    }

    let tail = body.strip_suffix(b";").unwrap_or(body);
    match tail.strip_suffix(b")") {
        Some(inner) => trim_padding(&inner[open + 1..]),
        None => body,
    }
}
