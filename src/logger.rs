use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

/// Host event sink. Paths passed in are always the client-supplied relative
/// form; resolved host paths never reach a log line.
pub trait Logger: Send + Sync {
    fn start(&self, _root: &Path, _addr: SocketAddr, _write_allowed: bool, _exec_allowed: bool) {}
    fn request(&self, _id: &str, _op: &str, _rel: &str, _peer: SocketAddr, _status: u16) {}
    fn denied(&self, _op: &str, _peer: SocketAddr) {}
    fn escape(&self, _op: &str, _rel: &str, _peer: SocketAddr) {}
    fn error(&self, _context: &str, _rel: &str, _msg: &str) {}
    fn discovery(&self, _peer: SocketAddr) {}
    fn stop(&self, _requests: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_sink(Box::new(f)))
    }

    pub fn stderr() -> Self {
        Self::with_sink(Box::new(std::io::stderr()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    fn line(&self, s: &str) {
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, root: &Path, addr: SocketAddr, write_allowed: bool, exec_allowed: bool) {
        self.line(&format!(
            "START root={} addr={} write={} exec={}",
            root.display(),
            addr,
            write_allowed,
            exec_allowed
        ));
    }
    fn request(&self, id: &str, op: &str, rel: &str, peer: SocketAddr, status: u16) {
        self.line(&format!(
            "REQ id={id} op={op} path={rel:?} peer={peer} status={status}"
        ));
    }
    fn denied(&self, op: &str, peer: SocketAddr) {
        self.line(&format!("DENIED op={op} peer={peer}"));
    }
    fn escape(&self, op: &str, rel: &str, peer: SocketAddr) {
        self.line(&format!("ESCAPE op={op} path={rel:?} peer={peer}"));
    }
    fn error(&self, context: &str, rel: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} path={rel:?} msg={msg}"));
    }
    fn discovery(&self, peer: SocketAddr) {
        self.line(&format!("DISCOVERY peer={peer}"));
    }
    fn stop(&self, requests: u64, seconds: f64) {
        self.line(&format!("STOP requests={requests} seconds={seconds:.3}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_are_timestamped_key_value_records() {
        let buf = Shared::default();
        let logger = TextLogger::with_sink(Box::new(buf.clone()));
        let peer: SocketAddr = "192.168.1.9:50000".parse().unwrap();
        logger.request("abc", "list", "docs", peer, 200);
        logger.denied("upload", peer);

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0]
            .contains("REQ id=abc op=list path=\"docs\" peer=192.168.1.9:50000 status=200"));
        assert!(lines[1].contains("DENIED op=upload"));
    }

    #[test]
    fn file_logger_appends() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("logs/host.log");
        {
            let logger = TextLogger::new(&path).unwrap();
            logger.stop(3, 1.5);
        }
        {
            let logger = TextLogger::new(&path).unwrap();
            logger.stop(4, 2.0);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("STOP requests=3 seconds=1.500"));
    }
}
