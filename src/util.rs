//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::error::{Error, Result};

/// Run a blocking operation off the async executor.
///
/// Filesystem calls on the write and destroy paths go through here so a
/// slow disk stalls a worker thread, not the scheduler. A panic inside the
/// closure surfaces as [`Error::TaskJoin`].
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => Err(Error::TaskJoin(join.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_returns_value() {
        let n = blocking(|| Ok(7)).await.unwrap();
        assert_eq!(n, 7);
    }

    #[tokio::test]
    async fn test_blocking_propagates_error() {
        let err = blocking::<_, ()>(|| Err(Error::Serialize("nope".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialize(_)));
    }

    #[tokio::test]
    async fn test_blocking_panic_becomes_join_error() {
        let err = blocking::<_, ()>(|| panic!("boom")).await.unwrap_err();
        assert!(matches!(err, Error::TaskJoin(_)));
    }
}
