use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

static STUB_SEQ: AtomicU32 = AtomicU32::new(0);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Write an executable stub helper script and return its path. Each stub
/// gets its own directory so side-channel files ($0.in, $0.stops) never
/// collide across tests.
pub fn write_stub(name: &str, body: &str) -> PathBuf {
    let seq = STUB_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("graftbot-stub-{}-{}", std::process::id(), seq));
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Poll `cond` every 20 ms for up to ~5 s.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    false
}
