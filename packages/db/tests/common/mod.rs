use std::sync::LazyLock;

use tokio::sync::{Mutex, MutexGuard};

use symphony_db::{DbConfig, DbError};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

static INIT: LazyLock<Result<(), String>> = LazyLock::new(|| {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("build test database runtime");
        runtime.block_on(async move {
            let result = symphony_db::init(DbConfig::memory())
                .await
                .map(|_| ())
                .map_err(|err| err.to_string());
            let _ = tx.send(result);
            std::future::pending::<()>().await;
        });
    });
    rx.recv().expect("test database runtime exited")
});

pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = TEST_LOCK.lock().await;
    // Initialise the global connection on a runtime that outlives every
    // per-test `#[tokio::test]` runtime; otherwise the SurrealDB background
    // task dies with the first test's runtime and later tests fail with
    // "sending into a closed channel".
    if let Err(err) = &*INIT {
        panic!("test database init failed: {err}");
    }
    let db_conn = symphony_db::get_db()?;
    db_conn
        .query(
            "DELETE envelope; DELETE dead_letter; DELETE idempotency; \
             DELETE schedule; DELETE rate_limiter; DELETE circuit;",
        )
        .await?
        .check()?;
    Ok(guard)
}
