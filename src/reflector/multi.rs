//! Running several reflectors in one process.
//!
//! Some deployments replicate onto N LDB files (for the rotating reader)
//! from a single process. Each reflector gets its own LDB and upstream
//! handle; the change log is owned by reflector 0 alone, so downstream
//! consumers see exactly one change stream.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{Reflector, ReflectorConfig, ReflectorError};

/// N reflectors against N LDBs in one process.
pub struct MultiReflector {
    reflectors: Vec<Arc<Reflector>>,
}

impl MultiReflector {
    /// Builds one reflector per config.
    ///
    /// Change-log ownership: only the first config keeps its change log;
    /// any change log configured on the rest is dropped.
    pub fn new(mut configs: Vec<ReflectorConfig>) -> Self {
        for config in configs.iter_mut().skip(1) {
            if config.changelog.take().is_some() {
                tracing::warn!(
                    message = "Dropping change log from a secondary reflector.",
                    ldb_path = %config.ldb_path.display(),
                );
            }
        }
        Self {
            reflectors: configs
                .into_iter()
                .map(|config| Arc::new(Reflector::from_config(config)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.reflectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reflectors.is_empty()
    }

    /// Runs every reflector until cancellation or the first failure.
    ///
    /// A failing reflector cancels its siblings; the first error is
    /// returned after all of them unwind.
    pub async fn start(&self, token: CancellationToken) -> Result<(), ReflectorError> {
        let run_token = token.child_token();
        let handles: Vec<_> = self
            .reflectors
            .iter()
            .map(|reflector| {
                let reflector = Arc::clone(reflector);
                let sibling_token = run_token.clone();
                tokio::spawn(async move {
                    let result = reflector.start(sibling_token.clone()).await;
                    if result.is_err() {
                        sibling_token.cancel();
                    }
                    result
                })
            })
            .collect();

        let mut first_error = None;
        for handle in handles {
            let result = handle.await.expect("reflector task panicked");
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}
