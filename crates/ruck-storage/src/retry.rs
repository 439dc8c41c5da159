use std::io::Read;
use std::time::Duration;

use crossbeam_channel::Receiver;

use ruck_types::{CancelToken, Result, RuckError};

use crate::{Backend, FileInfo, FileType, Handle, SaveStream};

/// Retry/backoff policy for the [`RetryBackend`] decorator.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            retry_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

/// Decorator that retries transient transport errors with exponential
/// backoff + jitter.
///
/// The core never retries on its own; wrapping a backend in this type is the
/// "outer retry layer" that absorbs intermittent 5xx/429 responses and
/// network failures. Integrity, auth, precondition and not-found errors are
/// never retried.
///
/// `save` buffers streaming bodies in memory so the request can be replayed;
/// callers uploading packs already hold the full pack bytes, so this does not
/// change peak memory in practice.
pub struct RetryBackend<B> {
    inner: B,
    config: RetryConfig,
}

impl<B: Backend> RetryBackend<B> {
    pub fn new(inner: B, config: RetryConfig) -> Self {
        RetryBackend { inner, config }
    }

    fn retry_call<T>(
        &self,
        op_name: &str,
        cancel: &CancelToken,
        f: impl Fn() -> Result<T>,
    ) -> Result<T> {
        let mut delay_ms = self.config.retry_delay_ms;
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(self.config.retry_max_delay_ms);
            }
            cancel.check()?;
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    tracing::warn!(
                        "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        self.config.max_retries,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| RuckError::Other(format!("{op_name}: retries exhausted"))))
    }
}

impl<B: Backend> Backend for RetryBackend<B> {
    fn location(&self) -> String {
        self.inner.location()
    }

    fn test(&self, h: &Handle, cancel: &CancelToken) -> Result<bool> {
        self.retry_call(&format!("test {h}"), cancel, || self.inner.test(h, cancel))
    }

    fn save(&self, h: &Handle, body: SaveStream<'_>, cancel: &CancelToken) -> Result<()> {
        let (reader, _size) = body.into_parts();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        self.retry_call(&format!("save {h}"), cancel, || {
            self.inner.save_bytes(h, &buf, cancel)
        })
    }

    fn load(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Read + Send>> {
        // Only establishing the reader is retried; a failure while consuming
        // the returned stream surfaces to the caller.
        self.retry_call(&format!("load {h}"), cancel, || {
            self.inner.load(h, length, offset, cancel)
        })
    }

    fn stat(&self, h: &Handle, cancel: &CancelToken) -> Result<FileInfo> {
        self.retry_call(&format!("stat {h}"), cancel, || self.inner.stat(h, cancel))
    }

    fn remove(&self, h: &Handle, cancel: &CancelToken) -> Result<()> {
        self.retry_call(&format!("remove {h}"), cancel, || {
            self.inner.remove(h, cancel)
        })
    }

    fn list(&self, t: FileType, cancel: &CancelToken) -> Receiver<String> {
        self.inner.list(t, cancel)
    }

    fn delete(&self, cancel: &CancelToken) -> Result<()> {
        self.retry_call("delete repository", cancel, || self.inner.delete(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend that fails the first `failures` calls with a retryable error.
    struct FlakyBackend {
        failures: AtomicU32,
        saved: Mutex<Option<Vec<u8>>>,
        fail_with: fn() -> RuckError,
    }

    impl FlakyBackend {
        fn new(failures: u32, fail_with: fn() -> RuckError) -> Self {
            FlakyBackend {
                failures: AtomicU32::new(failures),
                saved: Mutex::new(None),
                fail_with,
            }
        }

        fn trip(&self) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err((self.fail_with)());
            }
            Ok(())
        }
    }

    impl Backend for FlakyBackend {
        fn location(&self) -> String {
            "flaky:".into()
        }
        fn test(&self, _h: &Handle, _c: &CancelToken) -> Result<bool> {
            self.trip()?;
            Ok(true)
        }
        fn save(&self, _h: &Handle, body: SaveStream<'_>, _c: &CancelToken) -> Result<()> {
            let (reader, _) = body.into_parts();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            self.trip()?;
            *self.saved.lock().unwrap() = Some(buf);
            Ok(())
        }
        fn load(
            &self,
            _h: &Handle,
            _length: u32,
            _offset: u64,
            _c: &CancelToken,
        ) -> Result<Box<dyn Read + Send>> {
            self.trip()?;
            Ok(Box::new(std::io::Cursor::new(b"ok".to_vec())))
        }
        fn stat(&self, _h: &Handle, _c: &CancelToken) -> Result<FileInfo> {
            self.trip()?;
            Ok(FileInfo { size: 2 })
        }
        fn remove(&self, _h: &Handle, _c: &CancelToken) -> Result<()> {
            self.trip()
        }
        fn list(&self, _t: FileType, _c: &CancelToken) -> Receiver<String> {
            let (_tx, rx) = crossbeam_channel::bounded(1);
            rx
        }
        fn delete(&self, _c: &CancelToken) -> Result<()> {
            self.trip()
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn transient_errors_are_retried() {
        let be = RetryBackend::new(
            FlakyBackend::new(2, || RuckError::http(503, "Service Unavailable")),
            fast_config(),
        );
        let h = Handle::new(FileType::Data, "ab");
        assert!(be.test(&h, &CancelToken::new()).unwrap());
    }

    #[test]
    fn save_replays_the_buffered_body() {
        let be = RetryBackend::new(
            FlakyBackend::new(1, || RuckError::http(500, "Internal Server Error")),
            fast_config(),
        );
        let h = Handle::new(FileType::Data, "ab");
        be.save_bytes(&h, b"payload", &CancelToken::new()).unwrap();
        assert_eq!(
            be.inner.saved.lock().unwrap().as_deref(),
            Some(b"payload".as_slice())
        );
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let be = RetryBackend::new(
            FlakyBackend::new(5, || RuckError::http(412, "Precondition Failed")),
            fast_config(),
        );
        let h = Handle::config();
        let err = be.test(&h, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, RuckError::Transport { status: 412, .. }));
        // Only one attempt was consumed.
        assert_eq!(be.inner.failures.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retries_exhaust_into_last_error() {
        let be = RetryBackend::new(
            FlakyBackend::new(10, || RuckError::http(503, "Service Unavailable")),
            fast_config(),
        );
        let h = Handle::new(FileType::Data, "ab");
        let err = be.stat(&h, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, RuckError::Transport { status: 503, .. }));
    }
}
