use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use reqwest::StatusCode;

use crate::{decode::JsonDecoder, Decode, DecodeFailure};

type Slot = Arc<dyn Any + Send + Sync>;

/// Response envelope: status, ordered headers and the raw body.
///
/// The body is decoded lazily by [`Response::decode`]. Each target type has
/// its own decode slot, written at most once by the first successful decode
/// into that type.
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    attempts: u32,
    decoder: Arc<JsonDecoder>,
    slots: Mutex<HashMap<TypeId, Slot>>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("attempts", &self.attempts)
            .field("decoded_shapes", &self.lock_slots().len())
            .finish()
    }
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        attempts: u32,
        decoder: Arc<JsonDecoder>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            attempts,
            decoder,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a response from parts, e.g. a body loaded from a cache.
    pub fn from_parts(status: StatusCode, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self::new(status, headers, body, 1, Arc::new(JsonDecoder::default()))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of a repeated header, in received order.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body as text; invalid UTF-8 is replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Attempts the fetcher made to obtain this response.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn decoder(&self) -> &JsonDecoder {
        &self.decoder
    }

    /// Decodes the body into `T`, reusing the memoized value when this
    /// response was already decoded into `T`.
    ///
    /// Slots of other target types are left untouched, so decoding into
    /// several shapes parses the body once per shape.
    pub fn decode<T: Decode>(&self) -> Result<Arc<T>, DecodeFailure> {
        if let Some(hit) = self.cached::<T>() {
            self.decoder.stats().record_hit();
            return Ok(hit);
        }

        // Parse outside the lock; a concurrent decode of the same shape may
        // finish first, in which case its value wins.
        let decoded = Arc::new(self.decoder.decode::<T>(&self.body)?);
        let mut slots = self.lock_slots();
        let slot = slots.entry(TypeId::of::<T>()).or_insert_with(|| {
            let erased: Slot = decoded.clone();
            erased
        });
        Ok(Arc::clone(slot).downcast::<T>().unwrap_or(decoded))
    }

    fn cached<T: Decode>(&self) -> Option<Arc<T>> {
        let slot = self.lock_slots().get(&TypeId::of::<T>()).cloned()?;
        slot.downcast::<T>().ok()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<TypeId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
